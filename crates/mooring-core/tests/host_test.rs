//! Plugin Host Tests
//!
//! End-to-end lifecycle tests including:
//! - Mounting into existing and late anchors
//! - Route eligibility and navigation debounce
//! - Crash ejection and load failures
//! - Replace-mode visibility
//! - Shutdown

mod common;

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use mooring_core::config::HostSettings;
use mooring_core::dom::{Document, HIDDEN_ATTRIBUTE};
use mooring_core::extension::{ExtensionState, IncidentCode, LoaderError, RenderError};
use mooring_core::PluginHost;
use mooring_testing::{
    DescriptorBuilder, FakeRemoteLoader, FlakyComponent, LoadBehavior, MemoryDocument,
    RenderBehavior, ScriptedComponent,
};

use common::{after_debounce, settle, WIDGET_KEY};

struct Fixture {
    doc: Arc<MemoryDocument>,
    loader: Arc<FakeRemoteLoader>,
    component: Arc<ScriptedComponent>,
    host: PluginHost,
}

fn fixture() -> Fixture {
    fixture_with(HostSettings::default())
}

fn fixture_with(settings: HostSettings) -> Fixture {
    let doc = MemoryDocument::new();
    let component = ScriptedComponent::describing("Widget");
    let loader = FakeRemoteLoader::new().with_component(WIDGET_KEY, component.as_component());
    let host = PluginHost::new(doc.clone(), loader.clone(), settings);
    Fixture {
        doc,
        loader,
        component,
        host,
    }
}

// ============================================================================
// Mounting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_mount_into_existing_slot() {
    let f = fixture();
    let slot = f.doc.add(f.doc.body(), "div#slot");

    f.host.set_descriptors(&[DescriptorBuilder::new("a")
        .target("#slot")
        .prop("label", json!("Hi"))
        .build()]);

    // The container exists before any await.
    let container = f
        .doc
        .element_by_id("plugin-container-a-0")
        .expect("container mounted synchronously");
    assert_eq!(f.doc.parent(container), Some(slot));
    assert!(!f.host.injector().has_bootstrap("a"));
    assert_eq!(f.host.state("a"), ExtensionState::Pending);

    settle().await;
    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert_eq!(
        f.doc.markup_of("plugin-container-a-0").as_deref(),
        Some("<Widget extension=\"a\" container=\"plugin-container-a-0\" props=\"label=\"Hi\"\">")
    );
    assert_eq!(f.loader.load_count(WIDGET_KEY), 1);
    assert_eq!(f.loader.register_count("remote_app"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mount_into_late_slot() {
    let f = fixture();
    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    settle().await;

    assert_eq!(f.host.state("a"), ExtensionState::Pending);
    assert!(f.host.injector().has_bootstrap("a"));
    // The component is preloaded while waiting for the anchor.
    assert_eq!(f.loader.load_count(WIDGET_KEY), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    f.doc.add(f.doc.body(), "div#slot");
    settle().await;

    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert!(f.doc.markup_of("plugin-container-a-0").is_some());
    assert!(!f.host.injector().has_bootstrap("a"));
    assert_eq!(f.doc.observer_count(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::BootstrapTimeout),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_timeout_is_recorded() {
    let f = fixture();
    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#never").build()]);

    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(f.doc.observer_count(), 0);
    assert!(!f.host.injector().has_bootstrap("a"));
    assert_eq!(
        f.host.registry().incidents("a").count(IncidentCode::BootstrapTimeout),
        1
    );
    assert_eq!(f.host.state("a"), ExtensionState::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_one_render_per_anchor() {
    let f = fixture();
    let list = f.doc.add(f.doc.body(), "ul");
    for _ in 0..3 {
        f.doc.add(list, "li.row");
    }

    f.host
        .set_descriptors(&[DescriptorBuilder::new("badge").target(".row").build()]);
    settle().await;

    assert_eq!(f.component.render_count(), 3);
    let mut containers = f.component.rendered_containers();
    containers.sort();
    assert_eq!(
        containers,
        vec![
            "plugin-container-badge-0",
            "plugin-container-badge-1",
            "plugin-container-badge-2",
        ]
    );

    let info = f.host.extensions();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].containers.len(), 3);
    assert!(info[0].timings.as_ref().is_some_and(|t| t.render_ms.is_some()));
}

#[tokio::test(start_paused = true)]
async fn test_new_anchor_under_observed_root_mounts() {
    let f = fixture();
    let feed = f.doc.add(f.doc.body(), "div#feed");
    f.doc.add(feed, "article.post");

    f.host.set_descriptors(&[DescriptorBuilder::new("likes")
        .target(".post")
        .observe("#feed")
        .build()]);
    settle().await;
    assert_eq!(f.component.render_count(), 1);

    f.doc.add(feed, "article.post");
    settle().await;
    assert_eq!(f.component.render_count(), 2);
    assert!(f.doc.markup_of("plugin-container-likes-1").is_some());
}

// ============================================================================
// Routes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_route_eligibility() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.host.set_descriptors(&[
        DescriptorBuilder::new("docs").route("/docs/*").build(),
        DescriptorBuilder::new("not-admin")
            .route("!/admin/*")
            .build(),
        DescriptorBuilder::new("everywhere").build(),
    ]);
    settle().await;
    assert_eq!(f.host.eligible(), vec!["not-admin", "everywhere"]);

    f.host.navigate_now("/docs/intro");
    settle().await;
    assert_eq!(f.host.eligible(), vec!["docs", "not-admin", "everywhere"]);
    assert_eq!(f.host.state("docs"), ExtensionState::Mounted);

    f.host.navigate_now("/admin/users");
    settle().await;
    assert_eq!(f.host.eligible(), vec!["everywhere"]);
    assert_eq!(f.host.state("docs"), ExtensionState::Unregistered);
    assert!(f.doc.element_by_id("plugin-container-docs-0").is_none());
    assert!(f.doc.element_by_id("plugin-container-not-admin-0").is_none());
    assert!(f.doc.element_by_id("plugin-container-everywhere-0").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_navigation_is_debounced() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.host
        .set_descriptors(&[DescriptorBuilder::new("docs").route("/docs/*").build()]);

    f.host.navigate("/docs/a");
    f.host.navigate("/settings");
    f.host.navigate("/docs/b");
    assert!(f.host.has_pending_navigation());
    assert_eq!(f.host.current_path(), "/");

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(f.host.eligible().is_empty());

    after_debounce().await;
    assert!(!f.host.has_pending_navigation());
    assert_eq!(f.host.current_path(), "/docs/b");
    settle().await;
    assert_eq!(f.host.state("docs"), ExtensionState::Mounted);
    assert_eq!(f.component.render_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_navigation_within_eligibility_keeps_mount() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.host
        .set_descriptors(&[DescriptorBuilder::new("docs").route("/docs/*").build()]);
    f.host.navigate_now("/docs/a");
    settle().await;
    let container = f.doc.element_by_id("plugin-container-docs-0");

    f.host.navigate_now("/docs/b");
    settle().await;
    assert_eq!(f.doc.element_by_id("plugin-container-docs-0"), container);
    assert_eq!(f.component.render_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_changed_descriptor_restarts_extension() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.doc.add(f.doc.body(), "div#other");
    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    settle().await;

    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#other").build()]);
    settle().await;

    let container = f
        .doc
        .element_by_id("plugin-container-a-0")
        .expect("remounted at the new target");
    let other = f.doc.query_selector_all("#other").unwrap()[0];
    assert_eq!(f.doc.parent(container), Some(other));
    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert_eq!(f.component.render_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_module_change_during_slow_load_mounts_only_new_module() {
    let doc = MemoryDocument::new();
    let loader = FakeRemoteLoader::new()
        .with_component(WIDGET_KEY, ScriptedComponent::describing("Widget").as_component())
        .with_component("remote_app/Other", ScriptedComponent::describing("Other").as_component())
        .with_key_latency(WIDGET_KEY, Duration::from_millis(100))
        .with_key_latency("remote_app/Other", Duration::from_millis(10));
    let host = PluginHost::new(doc.clone(), loader.clone(), HostSettings::default());
    doc.add(doc.body(), "div.slot");

    let descriptor = DescriptorBuilder::new("a").target(".slot").observe_document();
    host.set_descriptors(&[descriptor.clone().build()]);
    host.set_descriptors(&[descriptor.module("./Other").build()]);
    tokio::time::sleep(Duration::from_millis(300)).await;

    doc.add(doc.body(), "div.slot");
    settle().await;

    let cached = host.registry().get_plugin("a").expect("component cached");
    assert_eq!(cached.name(), "Other");
    for dom_id in ["plugin-container-a-0", "plugin-container-a-1"] {
        let markup = doc.markup_of(dom_id).expect("container rendered");
        assert!(markup.starts_with("<Other"), "{} rendered {}", dom_id, markup);
    }
}

#[tokio::test(start_paused = true)]
async fn test_leaving_before_preload_leaves_no_registry_entry() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.host
        .set_descriptors(&[DescriptorBuilder::new("docs").route("/docs/*").build()]);

    f.host.navigate_now("/docs/1");
    f.host.navigate_now("/settings");
    settle().await;

    assert_eq!(f.host.state("docs"), ExtensionState::Unregistered);
    assert!(f.host.registry().timings("docs").is_none());
    assert!(f.host.registry().get_plugin("docs").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_descriptor_does_not_touch_accepted_id() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    let report = f.host.set_descriptors(&[
        DescriptorBuilder::new("a").build(),
        DescriptorBuilder::new("a").target("#elsewhere").build(),
    ]);
    assert_eq!(report.rejected_count(), 1);
    settle().await;

    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert!(f.host.registry().incidents("a").counts.is_empty());
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::InvalidConfig),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_descriptors_are_reported() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    let report = f.host.set_descriptors(&[
        json!("nope"),
        DescriptorBuilder::new("bad").position("sideways").build(),
        DescriptorBuilder::new("good").build(),
    ]);
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.rejected_count(), 2);
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::InvalidConfig),
        1
    );

    settle().await;
    assert_eq!(f.host.state("good"), ExtensionState::Mounted);
    assert_eq!(f.host.state("bad"), ExtensionState::Unregistered);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_render_crash_ejects() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.component
        .set_behavior(RenderBehavior::Panic("boom".to_string()));

    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    settle().await;

    assert_eq!(f.host.state("a"), ExtensionState::Ejected);
    assert!(f.doc.element_by_id("plugin-container-a-0").is_none());
    assert!(f.host.injector().get_containers("a").is_empty());
    assert!(!f.host.injector().is_started("a"));
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::RenderError),
        1
    );

    // Healthy again, but nothing remounts until the next navigation.
    f.component.set_behavior(RenderBehavior::Describe);
    f.doc.add(f.doc.body(), "div.noise");
    settle().await;
    assert_eq!(f.host.state("a"), ExtensionState::Ejected);

    f.host.navigate("/");
    after_debounce().await;
    settle().await;
    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert!(f.doc.markup_of("plugin-container-a-0").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_crash_in_one_instance_ejects_all() {
    let doc = MemoryDocument::new();
    let list = doc.add(doc.body(), "ul");
    for _ in 0..3 {
        doc.add(list, "li.row");
    }
    let flaky = FlakyComponent::new("Flaky");
    let loader = FakeRemoteLoader::new().with_component(WIDGET_KEY, flaky.clone());
    let host = PluginHost::new(doc.clone(), loader, HostSettings::default());

    host.set_descriptors(&[DescriptorBuilder::new("badge").target(".row").build()]);
    settle().await;

    assert_eq!(host.state("badge"), ExtensionState::Ejected);
    assert!(host.injector().get_containers("badge").is_empty());
    assert_eq!(doc.query_selector_all("[data-plugin-container]").unwrap().len(), 0);

    // Only the instance that crashed ran before the ejection.
    assert_eq!(flaky.render_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_render_error_ejects() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.component
        .set_behavior(RenderBehavior::Fail("missing prop".to_string()));

    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    settle().await;
    assert_eq!(f.host.state("a"), ExtensionState::Ejected);
}

#[tokio::test(start_paused = true)]
async fn test_manual_eject() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    settle().await;

    f.host
        .eject("a", &RenderError::Failed("host requested".to_string()));
    assert_eq!(f.host.state("a"), ExtensionState::Ejected);
    assert!(f.doc.element_by_id("plugin-container-a-0").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_load_failure_fails_extension() {
    let f = fixture();
    let hero = f.doc.add(f.doc.body(), "div#hero");
    f.loader.set_behavior(
        WIDGET_KEY,
        LoadBehavior::Fail(LoaderError::Evaluation("syntax error".to_string())),
    );

    f.host.set_descriptors(&[DescriptorBuilder::new("a")
        .target("#hero")
        .position("replace")
        .build()]);
    settle().await;

    assert_eq!(f.host.state("a"), ExtensionState::Failed);
    assert!(f.doc.element_by_id("plugin-container-a-0").is_none());
    // The original comes back when the replacement never loads.
    assert!(f.doc.is_visible(hero));
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::RemoteLoadError),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_registration_failure_fails_extension() {
    let f = fixture();
    f.doc.add(f.doc.body(), "div#slot");
    f.loader.fail_registration("remote_app");

    f.host.set_descriptors(&[DescriptorBuilder::new("a").build()]);
    assert_eq!(f.host.state("a"), ExtensionState::Failed);
    assert!(f.doc.element_by_id("plugin-container-a-0").is_none());
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::RemoteRegisterError),
        1
    );

    f.loader.heal_registration("remote_app");
    f.host.navigate_now("/");
    settle().await;
    assert_eq!(f.host.state("a"), ExtensionState::Mounted);
    assert_eq!(f.loader.register_count("remote_app"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_load_timeout_fails_extension() {
    let settings = HostSettings {
        remote_load_timeout_ms: 2_000,
        ..Default::default()
    };
    let f = fixture_with(settings);
    f.doc.add(f.doc.body(), "div#slot");
    f.loader
        .set_behavior(WIDGET_KEY, LoadBehavior::Hang);

    f.host
        .set_descriptors(&[DescriptorBuilder::new("a").target("#slot").build()]);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(f.host.state("a"), ExtensionState::Pending);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(f.host.state("a"), ExtensionState::Failed);
    assert_eq!(
        f.host
            .registry()
            .incident_summary()
            .total(IncidentCode::RemoteLoadTimeout),
        1
    );
}

// ============================================================================
// Replace mode
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_replace_mode_swaps_visibility() {
    let f = fixture();
    let hero = f.doc.add(f.doc.body(), "div#hero");

    f.host.set_descriptors(&[DescriptorBuilder::new("banner")
        .target("#hero")
        .position("replace")
        .route("/home")
        .build()]);
    f.host.navigate_now("/home");
    let container = f
        .doc
        .element_by_id("plugin-container-banner-0")
        .expect("container placed");
    assert!(!f.doc.is_visible(hero));

    settle().await;
    assert_eq!(f.host.state("banner"), ExtensionState::Mounted);
    assert!(f.doc.is_visible(container));
    assert!(!f.doc.is_visible(hero));
    assert_eq!(
        f.doc.attribute(hero, HIDDEN_ATTRIBUTE).as_deref(),
        Some("true")
    );

    f.host.navigate_now("/elsewhere");
    assert!(f.doc.is_visible(hero));
    assert!(f.doc.attribute(hero, HIDDEN_ATTRIBUTE).is_none());
    assert!(!f.doc.is_connected(container));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_everything() {
    let f = fixture();
    let layout = f.doc.add(f.doc.body(), "div.layout");
    f.doc.add(layout, "div#slot");
    f.host.set_descriptors(&[
        DescriptorBuilder::new("a").target("#slot").observe(".layout").build(),
        DescriptorBuilder::new("b").target("#late").build(),
    ]);
    settle().await;
    f.host.navigate("/pending");

    f.host.shutdown();
    assert_eq!(f.doc.observer_count(), 0);
    assert!(f.doc.element_by_id("plugin-container-a-0").is_none());
    assert!(!f.host.has_pending_navigation());
    assert!(f.host.registry().get_plugin("a").is_none());
    assert_eq!(f.host.state("a"), ExtensionState::Unregistered);

    // Further calls are ignored.
    f.host
        .set_descriptors(&[DescriptorBuilder::new("c").target("#slot").build()]);
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert!(f.doc.element_by_id("plugin-container-c-0").is_none());
    assert_eq!(f.host.current_path(), "/");
}
