/// Presence Layer
///
/// Who is watching which dashboard, and how events reach them:
/// - `events`: the channel-keyed broadcast bus and client event frames
/// - `registry`: subscriptions driving the scheduler's start/stop

// Client events and channel fan-out
pub mod events;

// Viewer subscriptions per dashboard
pub mod registry;

pub use events::{channels, ClientEvent, EventBus, EventKind};
pub use registry::{PresenceRegistry, Subscription};
