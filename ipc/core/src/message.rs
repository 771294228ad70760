//! Messages exchanged between actors and their consumers
//!
//! A [`Message`] carries either user data (`msg_type > 0`) or an internal
//! notification (`msg_type < 0`): a status change or an error. Type `0` is
//! reserved for control frames and never reaches a consumer.

use crate::error::IpcError;
use crate::status::Status;

/// Type of control frames consumed by the engine
pub const CONTROL_MSG_TYPE: i32 = 0;

/// Type of status and error notifications
pub const INTERNAL_MSG_TYPE: i32 = -1;

/// Type of the sentinel returned when a timed read expires
pub const TIMEOUT_MSG_TYPE: i32 = 2;

/// A unit of data delivered by `read`
#[derive(Debug)]
pub struct Message {
    pub msg_type: i32,
    pub data: Vec<u8>,
    pub error: Option<IpcError>,
    pub status: Option<Status>,
}

/// Borrowed view of a message, in the order consumers should check it
#[derive(Debug)]
pub enum MessageKind<'a> {
    Error(&'a IpcError),
    Status(Status),
    Data { msg_type: i32, data: &'a [u8] },
}

impl Message {
    /// Create a user data message
    pub fn new(msg_type: i32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            data: data.into(),
            error: None,
            status: None,
        }
    }

    pub(crate) fn from_status(status: Status) -> Self {
        Self {
            msg_type: INTERNAL_MSG_TYPE,
            data: Vec::new(),
            error: None,
            status: Some(status),
        }
    }

    pub(crate) fn from_error(error: IpcError) -> Self {
        Self {
            msg_type: INTERNAL_MSG_TYPE,
            data: Vec::new(),
            error: Some(error),
            status: None,
        }
    }

    /// The sentinel returned by `read_timed` when the deadline passes
    pub fn timed_out() -> Self {
        Self {
            msg_type: TIMEOUT_MSG_TYPE,
            data: Vec::new(),
            error: Some(IpcError::TimedOut),
            status: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.msg_type == TIMEOUT_MSG_TYPE && matches!(self.error, Some(IpcError::TimedOut))
    }

    pub fn is_internal(&self) -> bool {
        self.msg_type < 0
    }

    /// Classify the message: errors first, then status changes, then data
    pub fn kind(&self) -> MessageKind<'_> {
        if let Some(err) = &self.error {
            MessageKind::Error(err)
        } else if let Some(status) = self.status {
            MessageKind::Status(status)
        } else {
            MessageKind::Data {
                msg_type: self.msg_type,
                data: &self.data,
            }
        }
    }

    /// Lossy UTF-8 rendering of the payload
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
