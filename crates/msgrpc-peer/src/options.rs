use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use msgrpc_frame::{ExtensionRegistry, FrameConfig};

/// Callback receiving diagnostic messages (unknown response ids, dropped
/// completions, failed notification handlers).
pub type DiagnosticSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum FirstArg {
    Value {
        value: Arc<dyn Any + Send + Sync>,
        type_id: TypeId,
        type_name: &'static str,
    },
    Endpoint,
}

/// Construction-time endpoint configuration.
#[derive(Clone)]
pub struct EndpointOptions {
    pub(crate) extensions: ExtensionRegistry,
    pub(crate) diagnostics: Option<DiagnosticSink>,
    pub(crate) first_arg: Option<FirstArg>,
    pub(crate) frame: FrameConfig,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            extensions: ExtensionRegistry::with_handles(),
            diagnostics: None,
            first_arg: None,
            frame: FrameConfig::default(),
        }
    }
}

impl EndpointOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the extension registry (default: buffer, window, tabpage).
    pub fn with_extensions(mut self, registry: ExtensionRegistry) -> Self {
        self.extensions = registry;
        self
    }

    /// Also send diagnostics to `sink`. They are always logged through `tracing`.
    pub fn with_diagnostics(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.diagnostics = Some(Arc::new(sink));
        self
    }

    /// Pass a clone of `value` as the first argument of every handler.
    ///
    /// Handlers must then take [`Prefixed<T>`](crate::Prefixed) first;
    /// registration checks this.
    pub fn with_first_arg<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.first_arg = Some(FirstArg::Value {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        });
        self
    }

    /// Pass the endpoint itself as the first argument of every handler,
    /// as `Prefixed<Endpoint>`.
    pub fn with_endpoint_first_arg(mut self) -> Self {
        self.first_arg = Some(FirstArg::Endpoint);
        self
    }

    pub fn with_frame_config(mut self, config: FrameConfig) -> Self {
        self.frame = config;
        self
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub(crate) fn first_arg_type(&self) -> Option<(TypeId, &'static str)> {
        match self.first_arg.as_ref()? {
            FirstArg::Value {
                type_id, type_name, ..
            } => Some((*type_id, *type_name)),
            FirstArg::Endpoint => Some((
                TypeId::of::<crate::Endpoint>(),
                type_name::<crate::Endpoint>(),
            )),
        }
    }
}

impl fmt::Debug for EndpointOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointOptions")
            .field("extensions", &self.extensions)
            .field("diagnostics", &self.diagnostics.is_some())
            .field("first_arg", &self.first_arg_type().map(|(_, name)| name))
            .field("frame", &self.frame)
            .finish()
    }
}
