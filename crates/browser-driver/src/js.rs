//! JavaScript snippets evaluated through `Runtime.evaluate`.
//!
//! The locator chain is shipped to the page as a JSON plan and resolved by
//! a small interpreter; everything the gate needs about each match comes
//! back in one round-trip.

use crate::locator::Locator;

/// Shared helpers: whitespace normalization, accessible-name computation,
/// role matching. Injected ahead of every query/action body.
const PRELUDE: &str = r#"
    const norm = (value) => (value || '').replace(/\s+/g, ' ').trim();
    const accName = (el) => {
        const label = el.getAttribute && el.getAttribute('aria-label');
        if (label) return label.trim();
        const labelledby = el.getAttribute && el.getAttribute('aria-labelledby');
        if (labelledby) {
            return labelledby.split(/\s+/)
                .map((id) => document.getElementById(id))
                .map((node) => node ? (node.textContent || '') : '')
                .join(' ')
                .trim();
        }
        if (el.id) {
            const forLabel = document.querySelector('label[for="' + CSS.escape(el.id) + '"]');
            if (forLabel) return norm(forLabel.textContent);
        }
        const closestLabel = el.closest && el.closest('label');
        if (closestLabel) return norm(closestLabel.textContent);
        if (el.placeholder) return el.placeholder.trim();
        if (el.title) return el.title.trim();
        return norm(el.innerText || el.textContent || el.value || '');
    };
    const IMPLICIT_ROLE = {
        button: 'button, input[type="button"], input[type="submit"], summary',
        link: 'a[href]',
        textbox: 'textarea, input:not([type]), input[type="text"], input[type="email"], input[type="password"], input[type="tel"], input[type="url"]',
        searchbox: 'input[type="search"]',
        combobox: 'select, input[list]',
        checkbox: 'input[type="checkbox"]',
        radio: 'input[type="radio"]',
        tab: '',
    };
    const matchesRole = (el, role) => {
        if (el.getAttribute && el.getAttribute('role') === role) return true;
        const implicit = IMPLICIT_ROLE[role];
        if (!implicit) return false;
        try { return el.matches(implicit); } catch (err) { return false; }
    };
    const nameMatches = (el, nm) => {
        if (!nm) return true;
        let name = norm(accName(el));
        let pattern = nm.pattern;
        if (nm.case_insensitive) { name = name.toLowerCase(); pattern = pattern.toLowerCase(); }
        return nm.regex ? name.includes(pattern) : name === pattern;
    };
    const segmentMatches = (root, seg) => {
        if (seg.kind === 'css') {
            let els;
            try { els = Array.from(root.querySelectorAll(seg.selector)); }
            catch (err) { return []; }
            if (seg.has_text) {
                const needle = seg.has_text.toLowerCase();
                els = els.filter((el) => norm(el.innerText || el.textContent).toLowerCase().includes(needle));
            }
            return els;
        }
        if (seg.kind === 'role') {
            return Array.from(root.querySelectorAll('*'))
                .filter((el) => matchesRole(el, seg.role) && nameMatches(el, seg.name));
        }
        return [];
    };
    const resolveChain = (segments) => {
        let roots = [document];
        for (const seg of segments) {
            if (seg.kind === 'nth') {
                roots = roots.slice(seg.index, seg.index + 1);
                continue;
            }
            const next = [];
            for (const root of roots) {
                for (const el of segmentMatches(root, seg)) {
                    if (!next.includes(el)) next.push(el);
                }
            }
            roots = next;
        }
        return roots.filter((node) => node && node.nodeType === 1);
    };
    const probe = (el) => {
        const style = window.getComputedStyle(el);
        const rect = el.getBoundingClientRect();
        const visible =
            style.visibility !== 'hidden' &&
            style.display !== 'none' &&
            (rect.width > 0 || rect.height > 0 || el.getClientRects().length > 0);
        let covered = false;
        if (visible) {
            const hit = document.elementFromPoint(rect.left + rect.width / 2, rect.top + rect.height / 2);
            covered = !!hit && hit !== el && !el.contains(hit) && !hit.contains(el);
        }
        return {
            tag: el.tagName.toLowerCase(),
            bbox: { x: rect.left, y: rect.top, width: rect.width, height: rect.height },
            visible,
            covered,
            enabled: !(el.disabled === true || (el.getAttribute && el.getAttribute('aria-disabled') === 'true')),
            read_only: el.readOnly === true || (el.getAttribute && el.getAttribute('aria-readonly') === 'true'),
            name: norm(accName(el)),
            in_tab: !!(el.closest && el.closest('[role="tab"]')),
            id: el.id || null,
        };
    };
"#;

fn plan_json(locator: &Locator) -> String {
    serde_json::to_string(&locator.segments).unwrap_or_else(|_| "[]".to_string())
}

/// Resolve the chain and return a probe per match.
pub fn query_script(locator: &Locator) -> String {
    format!(
        r#"(() => {{
{PRELUDE}
    const SEGMENTS = {plan};
    return resolveChain(SEGMENTS).map(probe);
}})()"#,
        plan = plan_json(locator)
    )
}

/// Resolve the chain to its first match bound as `el`, then run `body`.
/// `body` must return an object; a `{{ found: false }}` result means the
/// chain matched nothing.
pub fn action_script(locator: &Locator, body: &str) -> String {
    format!(
        r#"(() => {{
{PRELUDE}
    const SEGMENTS = {plan};
    const els = resolveChain(SEGMENTS);
    if (els.length === 0) {{ return {{ found: false }}; }}
    const el = els[0];
    {body}
}})()"#,
        plan = plan_json(locator)
    )
}

/// Focus and select existing content ahead of `Input.insertText`.
pub fn focus_and_select_body() -> &'static str {
    r#"
    if (typeof el.focus === 'function') el.focus();
    if (typeof el.select === 'function') el.select();
    return { found: true };
"#
}

pub fn focus_body() -> &'static str {
    r#"
    if (typeof el.focus === 'function') el.focus();
    return { found: true };
"#
}

pub fn scroll_into_view_body() -> &'static str {
    r#"
    el.scrollIntoView({ block: 'center', inline: 'center' });
    return { found: true };
"#
}

pub fn attribute_body(name: &str) -> String {
    let attr = serde_json::to_string(name).unwrap_or_else(|_| "\"\"".to_string());
    format!("return {{ found: true, value: el.getAttribute({attr}) }};")
}

pub fn accessible_name_body() -> &'static str {
    "return { found: true, value: norm(accName(el)) };"
}

/// Choose an option by value first, label second, and fire the framework
/// events a hand-picked option would.
pub fn select_option_body(value: &str) -> String {
    let target = serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"
    const target = {target};
    const options = Array.from(el.options || []);
    let option = options.find((opt) => opt.value === target);
    if (!option) option = options.find((opt) => norm(opt.text) === norm(target));
    if (!option) return {{ found: true, status: 'option-missing' }};
    el.value = option.value;
    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
    return {{ found: true, status: 'selected', value: el.value }};
"#
    )
}

/// Toggle only when the current state differs, so repeated checks are
/// no-ops.
pub fn set_checked_body(checked: bool) -> String {
    format!(
        r#"
    const target = {checked};
    if (!!el.checked !== target) {{ el.click(); }}
    return {{ found: true, checked: !!el.checked }};
"#
    )
}

/// Close-button patterns and backdrops cleared during overlay dismissal.
pub fn dismiss_overlays_script() -> &'static str {
    r#"(() => {
    let acted = 0;
    const closers = document.querySelectorAll(
        '[aria-label*="close" i], [aria-label*="dismiss" i], .modal-close, .close-button, [data-dismiss]'
    );
    for (const el of closers) {
        const rect = el.getBoundingClientRect();
        if (rect.width > 0 && rect.height > 0) { el.click(); acted += 1; }
    }
    const backdrops = document.querySelectorAll('.modal-backdrop, .overlay-backdrop, [class*="backdrop"]');
    for (const el of backdrops) { el.remove(); acted += 1; }
    return { acted };
})()"#
}

/// One DOM-idle sample: readiness state plus a cheap churn signal.
pub fn dom_sample_script() -> &'static str {
    r#"(() => ({
    ready: document.readyState,
    nodes: document.querySelectorAll('*').length
}))()"#
}

/// One network-idle sample: completed resource fetches so far.
pub fn network_sample_script() -> &'static str {
    "(() => performance.getEntriesByType('resource').length)()"
}

pub fn storage_dump_script() -> &'static str {
    r#"(() => ({
    origin: location.origin,
    local: Object.entries(localStorage),
    session: Object.entries(sessionStorage)
}))()"#
}

pub fn storage_restore_script(local: &str, session: &str) -> String {
    format!(
        r#"(() => {{
    const local = {local};
    const session = {session};
    for (const [key, value] of local) localStorage.setItem(key, value);
    for (const [key, value] of session) sessionStorage.setItem(key, value);
    return {{ restored: local.length + session.length }};
}})()"#
    )
}
