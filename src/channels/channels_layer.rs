// Channel layer - the edges that feed the engines and carry their output out.

pub mod intake;
pub mod operator;
pub mod reply_emitter;
pub mod ticker;

pub use intake::{Intake, IntakeCommand};
pub use operator::OperatorDesk;
pub use reply_emitter::ReplyEmitter;
pub use ticker::ScheduleTicker;
