//! Wire layer for sspps
//!
//! Every message is a little-endian frame:
//!
//! ```text
//! [msg_type:i32][seq_num:u32][ack_num:u32][fixed fields...]
//! variable-size messages then add [avail_size:u64][payload]
//! ```
//!
//! Modules:
//! - `msg_type`: numeric message tags
//! - `message`: typed messages and their codec
//! - `record_buff`: bounded record buffers used for server row pushes
//! - `tracker`: per-destination send / ack bookkeeping (backpressure)
//! - `pacing`: transmission time estimates used to space out sends
//! - `bus`: the `CommBus` transport seam and an in-process `LocalBus`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod error;
pub mod message;
pub mod msg_type;
pub mod pacing;
pub mod record_buff;
pub mod tracker;

pub use bus::{CommBus, Endpoint, LocalBus};
pub use error::{Result, WireError};
pub use message::{Envelope, Message, HEADER_SIZE};
pub use msg_type::MsgType;
pub use pacing::TransTimeEstimate;
pub use record_buff::{PushRowReader, PushedRow, RecordBuff, RECORD_HEADER_SIZE};
pub use tracker::MsgTracker;
