//! End-to-end engine runs against scripted pages.

use std::path::Path;
use std::sync::Arc;

use browser_driver::fake::{FakeDriver, FakeElement};
use pacts_core_types::{
    Action, EngineConfig, FailureKind, Intent, RunRecord, Step, Strategy, Verdict,
};
use run_coordinator::{DefaultBlockedDetector, EngineStack};
use selector_cache::InMemoryStore;
use tokio_util::sync::CancellationToken;

fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        screenshot_dir: dir.join("screenshots"),
        artifact_dir: dir.join("artifacts"),
        cache_path: dir.join("cache.json"),
        run_store_path: dir.join("runs.jsonl"),
        hitl_code_file: dir.join("hitl/2fa_code.txt"),
        hitl_flag_file: dir.join("hitl/continue.ok"),
        ..EngineConfig::default()
    }
}

fn stack(driver: Arc<FakeDriver>, config: EngineConfig) -> EngineStack {
    EngineStack::assemble(
        driver,
        config,
        Arc::new(InMemoryStore::default()),
        Arc::new(DefaultBlockedDetector::new()),
        Vec::new(),
    )
}

fn intents(steps: Vec<Step>) -> Vec<Intent> {
    steps.into_iter().map(Intent::new).collect()
}

async fn run(stack: &EngineStack, url: &str, steps: Vec<Step>) -> RunRecord {
    stack
        .coordinator
        .run(url, intents(steps), CancellationToken::new())
        .await
}

#[tokio::test(start_paused = true)]
async fn simple_search_passes_and_seeds_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(
        FakeElement::new("search", "input")
            .with_attr("type", "search")
            .with_aria_label("Search"),
    );
    let stack = stack(driver.clone(), test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![
            Step::new("Search", Action::Fill).with_value("X"),
            Step::new("Search", Action::Press).with_value("Enter"),
        ],
    )
    .await;

    assert_eq!(record.verdict, Verdict::Pass);
    assert_eq!(record.executed_steps.len(), 2);
    assert_eq!(driver.element_value("search").as_deref(), Some("X"));

    // Two screenshots, deterministically named.
    assert_eq!(record.artifacts.len(), 2);
    assert!(record.artifacts[0].contains("step01_search"));
    assert!(record.artifacts[1].contains("step02_search"));
    for artifact in &record.artifacts {
        assert!(Path::new(artifact).exists());
    }

    // The selector landed in the cache under the normalized label.
    let entry = stack.cache.read("https://shop.test", "search", None).unwrap();
    assert_eq!(entry.selector, "input[aria-label=\"Search\"]");
    assert_eq!(entry.strategy, Strategy::AriaLabel);
    assert!(entry.stable);
}

#[tokio::test(start_paused = true)]
async fn hidden_input_is_activated_and_recorded_as_a_heal() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(
        FakeElement::new("toggle", "button")
            .with_aria_label("Search")
            .reveals_on_click("hidden-search"),
    );
    driver.add_element(
        FakeElement::new("hidden-search", "input")
            .with_attr("placeholder", "Search")
            .hidden(),
    );
    let stack = stack(driver.clone(), test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![Step::new("Search", Action::Fill).with_value("Y")],
    )
    .await;

    assert_eq!(record.verdict, Verdict::Pass);
    assert_eq!(driver.element_value("hidden-search").as_deref(), Some("Y"));
    assert_eq!(record.heal_events.len(), 1);
    let event = &record.heal_events[0];
    assert!(event.success);
    assert!(event.actions.contains(&"activate_adjacent".to_string()));
}

#[tokio::test(start_paused = true)]
async fn duplicate_buttons_resolve_through_disambiguation() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(
        FakeElement::new("tab-save", "button")
            .with_text("Save")
            .inside_tab(),
    );
    driver.add_element(FakeElement::new("primary-save", "button").with_text("Save"));
    let stack = stack(driver, test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![Step::new("Save", Action::Click)],
    )
    .await;

    assert_eq!(record.verdict, Verdict::Pass);
    let executed = &record.executed_steps[0];
    assert_eq!(executed.strategy, Some(Strategy::RoleNameDisambiguated));
    assert!(
        executed.selector.as_deref().unwrap().contains("nth=1"),
        "selector should pin the surviving candidate: {:?}",
        executed.selector
    );
}

#[tokio::test(start_paused = true)]
async fn missing_element_fails_within_the_heal_bound() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    let stack = stack(driver, test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![Step::new("Ghost", Action::Click)],
    )
    .await;

    match &record.verdict {
        Verdict::Fail { kind, rca_detail } => {
            assert_eq!(*kind, FailureKind::DiscoveryNone);
            assert!(rca_detail.contains("not found after"), "{rca_detail}");
        }
        other => panic!("expected Fail(DiscoveryNone), got {other:?}"),
    }
    assert!(record.heal_events.len() <= 3);
    assert!(record.executed_steps.is_empty());
    // Both heal attempts came up empty; the second one is terminal.
    assert!(record
        .heal_events
        .iter()
        .all(|e| e.new_selector.is_none() && !e.success));
}

#[tokio::test(start_paused = true)]
async fn challenge_pages_block_without_healing() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(FakeElement::new("captcha", "div").with_class("g-recaptcha"));
    driver.add_element(FakeElement::new("login", "button").with_text("Login"));
    let stack = stack(driver, test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![Step::new("Login", Action::Click)],
    )
    .await;

    match &record.verdict {
        Verdict::Blocked { signature } => {
            assert!(signature.contains(".g-recaptcha"), "{signature}");
        }
        other => panic!("expected Blocked, got {other:?}"),
    }
    assert!(record.heal_events.is_empty());
    assert!(record.executed_steps.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hitl_wait_resumes_on_env_signal_and_snapshots_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hitl_env_var = "PACTS_E2E_2FA".into();
    config.session_state_path = Some(dir.path().join("session.json"));

    let driver = FakeDriver::new("https://bank.test");
    driver.add_element(FakeElement::new("user", "input").with_aria_label("Username"));
    driver.add_element(FakeElement::new("code", "input").with_aria_label("Code"));
    let stack = stack(driver.clone(), config);

    std::env::set_var("PACTS_E2E_2FA", "424242");
    let record = run(
        &stack,
        "https://bank.test",
        vec![
            Step::new("Username", Action::Fill).with_value("ada"),
            Step::new("2FA", Action::Wait),
            Step::new("Code", Action::Fill).with_value("424242"),
        ],
    )
    .await;
    std::env::remove_var("PACTS_E2E_2FA");

    assert_eq!(record.verdict, Verdict::Pass);
    // The wait step itself executes nothing; both fills did.
    assert_eq!(record.executed_steps.len(), 2);
    assert_eq!(driver.element_value("code").as_deref(), Some("424242"));

    // Session state captured exactly once, at the configured path.
    assert!(dir.path().join("session.json").exists());
    let saves = driver
        .action_log()
        .iter()
        .filter(|line| line.starts_with("storage_state_save"))
        .count();
    assert_eq!(saves, 1);
}

#[tokio::test(start_paused = true)]
async fn wait_without_signal_times_out_as_wait_for_human() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hitl_env_var = "PACTS_E2E_2FA_SILENT".into();
    let driver = FakeDriver::new("https://bank.test");
    let stack = stack(driver, config);

    let record = run(
        &stack,
        "https://bank.test",
        vec![Step::new("2FA", Action::Wait)],
    )
    .await;

    match &record.verdict {
        Verdict::Fail { kind, rca_detail } => {
            assert_eq!(*kind, FailureKind::WaitForHuman);
            assert!(rca_detail.contains("900000"), "{rca_detail}");
        }
        other => panic!("expected Fail(WaitForHuman), got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn all_wait_plan_performs_one_suspension_per_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.hitl_env_var = "PACTS_E2E_2FA_ALLWAIT".into();
    let driver = FakeDriver::new("https://bank.test");
    let stack = stack(driver, config);

    std::env::set_var("PACTS_E2E_2FA_ALLWAIT", "1");
    let record = run(
        &stack,
        "https://bank.test",
        vec![
            Step::new("First gate", Action::Wait),
            Step::new("Second gate", Action::Wait),
        ],
    )
    .await;
    std::env::remove_var("PACTS_E2E_2FA_ALLWAIT");

    assert_eq!(record.verdict, Verdict::Pass);
    assert!(record.executed_steps.is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_plan_passes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    let stack = stack(driver.clone(), test_config(dir.path()));

    let record = run(&stack, "https://shop.test", vec![]).await;

    assert_eq!(record.verdict, Verdict::Pass);
    assert!(record.executed_steps.is_empty());
    assert!(record.heal_events.is_empty());
    // The driver was acquired and released around the empty plan.
    let log = driver.action_log();
    assert!(log.contains(&"start".to_string()));
    assert!(log.contains(&"stop".to_string()));
}

#[tokio::test(start_paused = true)]
async fn cancellation_produces_a_cancelled_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(FakeElement::new("go", "button").with_text("Go"));
    let stack = stack(driver, test_config(dir.path()));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let record = stack
        .coordinator
        .run(
            "https://shop.test",
            intents(vec![Step::new("Go", Action::Click)]),
            cancel,
        )
        .await;

    match &record.verdict {
        Verdict::Fail { kind, .. } => assert_eq!(*kind, FailureKind::Cancelled),
        other => panic!("expected Fail(Cancelled), got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn warmed_cache_replays_identical_selectors() {
    let dir = tempfile::tempdir().unwrap();
    let durable = Arc::new(InMemoryStore::default());

    let steps = || {
        vec![
            Step::new("Search", Action::Fill).with_value("X"),
            Step::new("Go", Action::Click),
        ]
    };
    let page = || {
        let driver = FakeDriver::new("https://shop.test");
        driver.add_element(FakeElement::new("search", "input").with_aria_label("Search"));
        driver.add_element(FakeElement::new("go", "button").with_text("Go"));
        driver
    };

    let first_stack = EngineStack::assemble(
        page(),
        test_config(dir.path()),
        durable.clone(),
        Arc::new(DefaultBlockedDetector::new()),
        Vec::new(),
    );
    let first = run(&first_stack, "https://shop.test", steps()).await;
    assert_eq!(first.verdict, Verdict::Pass);

    // Fresh driver and stack, shared durable layer: selector choices and
    // executed steps replay byte-identically.
    let second_stack = EngineStack::assemble(
        page(),
        test_config(dir.path()),
        durable,
        Arc::new(DefaultBlockedDetector::new()),
        Vec::new(),
    );
    let second = run(&second_stack, "https://shop.test", steps()).await;
    assert_eq!(second.verdict, Verdict::Pass);

    let selectors = |record: &RunRecord| {
        record
            .executed_steps
            .iter()
            .map(|s| s.selector.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(selectors(&first), selectors(&second));
    assert_eq!(
        first.executed_steps.len(),
        second.executed_steps.len()
    );
}

#[tokio::test(start_paused = true)]
async fn run_records_round_trip_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let driver = FakeDriver::new("https://shop.test");
    driver.add_element(FakeElement::new("go", "button").with_text("Go"));
    let stack = stack(driver, test_config(dir.path()));

    let record = run(
        &stack,
        "https://shop.test",
        vec![Step::new("Go", Action::Click)],
    )
    .await;
    assert_eq!(record.verdict, Verdict::Pass);

    let loaded = stack.run_store.load_all().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0], record);
}
