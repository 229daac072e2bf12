//! Components with scripted render behavior.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use mooring_core::extension::{
    ComponentRef, PluginComponent, RenderContext, RenderError, RenderedContent,
};

/// How a [`ScriptedComponent`] reacts to a render call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderBehavior {
    /// Render `<name>` with the extension id, container id and sorted props.
    Describe,
    /// Render this exact markup.
    Static(String),
    /// Return a render error.
    Fail(String),
    /// Panic with this message.
    Panic(String),
}

/// Component whose behavior can be switched between renders.
pub struct ScriptedComponent {
    name: String,
    behavior: Mutex<RenderBehavior>,
    renders: AtomicUsize,
    containers: Mutex<Vec<String>>,
}

impl ScriptedComponent {
    pub fn new(name: impl Into<String>, behavior: RenderBehavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behavior: Mutex::new(behavior),
            renders: AtomicUsize::new(0),
            containers: Mutex::new(Vec::new()),
        })
    }

    pub fn describing(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, RenderBehavior::Describe)
    }

    pub fn panicking(name: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Self::new(name, RenderBehavior::Panic(message.into()))
    }

    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Arc<Self> {
        Self::new(name, RenderBehavior::Fail(message.into()))
    }

    pub fn set_behavior(&self, behavior: RenderBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Render calls so far, crashed ones included.
    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Container ids rendered into, in call order.
    pub fn rendered_containers(&self) -> Vec<String> {
        self.containers.lock().clone()
    }

    pub fn as_component(self: &Arc<Self>) -> ComponentRef {
        self.clone()
    }
}

impl PluginComponent for ScriptedComponent {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedContent, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().push(ctx.container_id.to_string());
        // Clone so the lock is not held while panicking.
        let behavior = self.behavior.lock().clone();
        match behavior {
            RenderBehavior::Describe => {
                let mut props: Vec<String> = ctx
                    .props
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect();
                props.sort();
                Ok(RenderedContent::new(format!(
                    "<{} extension=\"{}\" container=\"{}\" props=\"{}\">",
                    self.name,
                    ctx.extension_id,
                    ctx.container_id,
                    props.join(",")
                )))
            }
            RenderBehavior::Static(markup) => Ok(RenderedContent::new(markup)),
            RenderBehavior::Fail(message) => Err(RenderError::Failed(message)),
            RenderBehavior::Panic(message) => panic!("{}", message),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Panics on the first render only, then renders normally.
pub struct FlakyComponent {
    inner: Arc<ScriptedComponent>,
    tripped: AtomicBool,
}

impl FlakyComponent {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            inner: ScriptedComponent::describing(name),
            tripped: AtomicBool::new(false),
        })
    }

    pub fn render_count(&self) -> usize {
        self.inner.render_count()
    }
}

impl PluginComponent for FlakyComponent {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<RenderedContent, RenderError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            self.inner.renders.fetch_add(1, Ordering::SeqCst);
            panic!("first render always fails");
        }
        self.inner.render(ctx)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
