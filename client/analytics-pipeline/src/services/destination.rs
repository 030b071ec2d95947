use crate::error::DestinationError;
use crate::services::consent::ConsentCategory;
use crate::services::export::ExportBuffer;
use event_schema::AnalyticsEvent;

/// An external sink that receives every admitted event.
///
/// Handlers run synchronously on the dispatching thread. Errors and panics
/// are contained by the dispatcher.
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    /// Consent category that must be granted before `handle` is called
    fn category(&self) -> ConsentCategory {
        ConsentCategory::Analytics
    }

    fn handle(&self, event: &AnalyticsEvent) -> Result<(), DestinationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestinationId(pub(crate) u64);

/// Adapts a closure into a [`Destination`]
pub struct FnDestination<F> {
    name: String,
    category: ConsentCategory,
    handler: F,
}

impl<F> FnDestination<F>
where
    F: Fn(&AnalyticsEvent) -> Result<(), DestinationError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            category: ConsentCategory::Analytics,
            handler,
        }
    }

    pub fn with_category(mut self, category: ConsentCategory) -> Self {
        self.category = category;
        self
    }
}

impl<F> Destination for FnDestination<F>
where
    F: Fn(&AnalyticsEvent) -> Result<(), DestinationError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> ConsentCategory {
        self.category
    }

    fn handle(&self, event: &AnalyticsEvent) -> Result<(), DestinationError> {
        (self.handler)(event)
    }
}

/// Routes track and page events into the export buffer.
///
/// Conversions always reach the buffer directly, so they are skipped here.
pub struct ExportDestination {
    buffer: ExportBuffer,
}

impl ExportDestination {
    pub fn new(buffer: ExportBuffer) -> Self {
        Self { buffer }
    }
}

impl Destination for ExportDestination {
    fn name(&self) -> &str {
        "export"
    }

    fn handle(&self, event: &AnalyticsEvent) -> Result<(), DestinationError> {
        if event.event_type() != event_schema::EventType::Conversion {
            self.buffer.buffer_event(event);
        }
        Ok(())
    }
}
