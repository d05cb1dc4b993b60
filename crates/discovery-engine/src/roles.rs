//! Role inference and label-to-name heuristics.

use once_cell::sync::Lazy;
use pacts_core_types::Action;
use std::collections::HashMap;

/// Roles worth probing for an action, most specific first.
pub fn roles_for_action(action: Action) -> &'static [&'static str] {
    match action {
        Action::Fill | Action::Type => &["textbox", "searchbox", "combobox"],
        Action::Click => &["button", "link"],
        Action::Select => &["combobox"],
        Action::Check | Action::Uncheck => &["checkbox"],
        Action::Press => &["textbox", "searchbox"],
        Action::Hover | Action::Focus => &["button", "link", "textbox"],
        Action::Wait => &[],
    }
}

/// Tag used for `:has-text` probing of a role.
pub fn tag_for_role(role: &str) -> &'static str {
    match role {
        "button" => "button",
        "link" => "a",
        "combobox" => "select",
        _ => "*",
    }
}

/// Conventional field-name aliases seen across form stacks.
static NAME_ALIASES: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    map.insert("search", &["q", "query", "search"]);
    map.insert("username", &["username", "user", "login"]);
    map.insert("email", &["email", "mail"]);
    map.insert("password", &["password", "pass", "pwd"]);
    map.insert("phone", &["phone", "tel"]);
    map.insert("first name", &["first_name", "firstname", "fname"]);
    map.insert("last name", &["last_name", "lastname", "lname"]);
    map
});

/// Candidate `name` attribute values derived from a human label.
pub fn name_candidates(label: &str) -> Vec<String> {
    let lower = label.trim().to_lowercase();
    let mut out = Vec::new();
    let mut push = |value: String| {
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    };

    if let Some(aliases) = NAME_ALIASES.get(lower.as_str()) {
        for alias in aliases.iter() {
            push((*alias).to_string());
        }
    }
    push(lower.replace(' ', "_"));
    push(lower.replace(' ', "-"));
    push(lower.replace(' ', ""));
    if let Some(first) = lower.split_whitespace().next() {
        push(first.to_string());
    }
    out
}

/// Names that mark dismissal controls; disambiguation filters these out.
pub fn is_dismissal_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    ["close", "remove", "dismiss"]
        .iter()
        .any(|needle| lower.contains(needle))
}
