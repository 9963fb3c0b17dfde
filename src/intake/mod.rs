//! Conversational intake: one-time links, guided interview sessions, and
//! dispatch of the finished report.

pub mod dispatch;
pub mod links;
pub mod messages;
pub mod model;
pub mod prompts;
pub mod routes;
pub mod session;

pub use dispatch::FinalizationDispatcher;
pub use links::LinkRegistry;
pub use messages::MessageStore;
pub use routes::intake_routes;
pub use session::{IntakeOrchestrator, StartedSession, TurnReply};
