pub mod actions;
pub mod bus;
mod error;
pub mod poll;
mod runtime;
pub mod session;
pub mod transport;

pub use actions::{ActionManager, HistoryEntry};
pub use bus::{EventFilter, NotificationBus, Subscription, SubscriptionId};
pub use error::{ActionError, BusError, ExecutionError, PollError, SessionError};
pub use poll::{PauseGuard, PollLoop, PollStatus, Watermark};
pub use runtime::Runtime;
pub use session::{
    parse_mailto, CloseMode, NullRenderSink, QueryResult, RenderSink, ResultCache, Selection,
    SessionController, SessionId, ViewId, ViewKind, ViewSnapshot, ViewSpec,
};
pub use transport::{SmtpTransport, Transport, TransportError, UnconfiguredTransport};
