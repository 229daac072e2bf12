//! Render isolation.
//!
//! Every mounted extension instance renders inside an [`IsolationBoundary`]. A
//! render that returns an error or panics yields nothing to mount, and the crash
//! is reported to the boundary's crash handler instead of reaching the host.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

use super::component::{ComponentRef, RenderContext, RenderError, RenderedContent};

/// Called with the extension id and the failure when a render crashes.
pub type CrashHandler = Arc<dyn Fn(&str, &RenderError) + Send + Sync>;

thread_local! {
    static IN_ISOLATED_RENDER: Cell<bool> = const { Cell::new(false) };
}

/// Failure boundary around one component.
#[derive(Clone)]
pub struct IsolationBoundary {
    on_crash: CrashHandler,
}

impl IsolationBoundary {
    pub fn new(on_crash: CrashHandler) -> Self {
        Self { on_crash }
    }

    /// Render `component`. Returns `None` after a crash; the crash handler has
    /// already been invoked by then.
    pub fn render(
        &self,
        component: &ComponentRef,
        ctx: &RenderContext<'_>,
    ) -> Option<RenderedContent> {
        match render_guarded(component, ctx) {
            Ok(content) => Some(content),
            Err(e) => {
                error!(
                    category = "plugins",
                    extension_id = %ctx.extension_id,
                    container = %ctx.container_id,
                    component = component.name(),
                    "Plugin render crashed: {}",
                    e
                );
                (self.on_crash)(ctx.extension_id, &e);
                None
            }
        }
    }
}

/// Run one render, converting a panic into [`RenderError::Panicked`].
pub fn render_guarded(
    component: &ComponentRef,
    ctx: &RenderContext<'_>,
) -> Result<RenderedContent, RenderError> {
    let previous = IN_ISOLATED_RENDER.with(|flag| flag.replace(true));
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| component.render(ctx)));
    IN_ISOLATED_RENDER.with(|flag| flag.set(previous));

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(RenderError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Install a process-wide panic hook that keeps panics raised inside an isolated
/// render off stderr. Other panics go to the previous hook. Installed once.
pub fn install_render_panic_hook() {
    static INSTALLED: AtomicBool = AtomicBool::new(false);
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info: &panic::PanicHookInfo| {
        if IN_ISOLATED_RENDER.with(Cell::get) {
            error!(
                category = "plugins",
                location = ?info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
                "Panic inside isolated plugin render"
            );
            return;
        }
        previous(info);
    }));
}
