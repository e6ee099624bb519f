//! Consumer side of a session: the update queue and the loop that feeds
//! drained batches to the bot.

pub(crate) mod dispatcher;
pub mod queue;

pub use queue::{update_queue, QueueDepth, UpdateReceiver, UpdateSender};
