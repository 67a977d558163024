use bulwark::CancellationRegistry;
use tower::Layer;

use crate::cancel_service::SupersedeService;
use crate::events::Events;

/// Keeps only the newest call per cancellation key alive.
#[derive(Debug, Clone)]
pub struct SupersedeLayer {
    registry: CancellationRegistry,
    events: Events,
}

impl SupersedeLayer {
    pub fn new(registry: CancellationRegistry) -> Self {
        Self {
            registry,
            events: Events::default(),
        }
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }
}

impl<S> Layer<S> for SupersedeLayer {
    type Service = SupersedeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SupersedeService {
            inner,
            registry: self.registry.clone(),
            events: self.events.clone(),
        }
    }
}
