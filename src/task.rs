//! Task management functions and asynchronous events
//!
//! Task management requests are validated on receipt and queued on the
//! session's [`CommandQueue`]; the execution pass runs them before any
//! ordinary command. Async events are built into Async Message PDUs for the
//! connection's manager thread to send.

use crate::command::{AbortCode, Command, CommandQueue, CommandState, OwnerId};
use crate::error::IscsiError;
use crate::lun::MAX_LUNS;
use crate::pdu::{async_event, pack_lun, task_function, task_response, unpack_lun, IscsiPdu, TaskMgmtRequest, RESERVED_TAG};
use std::str::FromStr;

/// A queued task management request
#[derive(Debug, Clone)]
pub struct TaskMessage {
    pub function: u8,
    /// ITT of the TMF request itself
    pub itt: u32,
    pub referenced_task_tag: u32,
    pub lun: u16,
    pub owner: OwnerId,
}

impl TaskMessage {
    pub fn new(function: u8, itt: u32, referenced_task_tag: u32, lun: u16, owner: OwnerId) -> Self {
        TaskMessage {
            function,
            itt,
            referenced_task_tag,
            lun,
            owner,
        }
    }

    /// Apply the function to the command list, returning the TMF response code
    pub fn execute(&self, commands: &mut [Command]) -> u8 {
        let live = |c: &&mut Command| c.state != CommandState::Dequeue && c.abort == AbortCode::Open;

        match self.function {
            task_function::ABORT_TASK => {
                let target = commands
                    .iter_mut()
                    .filter(live)
                    .find(|c| c.itt == self.referenced_task_tag && c.lun == self.lun);
                match target {
                    Some(cmd) => {
                        log::info!("aborting command id={} ITT {:#x} in state {:?}", cmd.id, cmd.itt, cmd.state);
                        cmd.abort = AbortCode::Aborted;
                        task_response::FUNCTION_COMPLETE
                    }
                    None => {
                        log::warn!("ABORT TASK: no command with ITT {:#x} on LUN {}", self.referenced_task_tag, self.lun);
                        task_response::TASK_DOES_NOT_EXIST
                    }
                }
            }
            task_function::LOGICAL_UNIT_RESET => {
                if self.lun as usize >= MAX_LUNS {
                    return task_response::LUN_DOES_NOT_EXIST;
                }
                let mut released = 0;
                for cmd in commands.iter_mut().filter(live).filter(|c| c.lun == self.lun) {
                    cmd.abort = AbortCode::Released;
                    released += 1;
                }
                log::info!("LUN {} reset released {} commands", self.lun, released);
                task_response::FUNCTION_COMPLETE
            }
            task_function::TARGET_WARM_RESET | task_function::TARGET_COLD_RESET => {
                let mut released = 0;
                for cmd in commands.iter_mut().filter(live) {
                    cmd.abort = AbortCode::Released;
                    released += 1;
                }
                log::info!("target reset released {} commands", released);
                task_response::FUNCTION_COMPLETE
            }
            _ => task_response::FUNCTION_REJECTED,
        }
    }
}

/// Accept a Task Management Function Request
///
/// Returns `Some(response)` when the request is answered at once without
/// being queued; `None` when it was queued for the next execution pass.
pub fn rx_task_mgmt_fn(queue: &mut CommandQueue, req: &TaskMgmtRequest, owner: OwnerId) -> Option<u8> {
    match req.function {
        task_function::ABORT_TASK_SET | task_function::CLEAR_ACA | task_function::CLEAR_TASK_SET => {
            log::warn!("task management function {} not implemented", req.function);
            return Some(task_response::FUNCTION_NOT_SUPPORTED);
        }
        task_function::TASK_REASSIGN => return Some(task_response::REASSIGNMENT_NOT_SUPPORTED),
        task_function::ABORT_TASK
        | task_function::LOGICAL_UNIT_RESET
        | task_function::TARGET_WARM_RESET
        | task_function::TARGET_COLD_RESET => {}
        other => {
            log::warn!("unknown task management function {}", other);
            return Some(task_response::FUNCTION_REJECTED);
        }
    }

    if req.function == task_function::ABORT_TASK && req.referenced_task_tag == RESERVED_TAG {
        return Some(task_response::FUNCTION_REJECTED);
    }

    let lun = match unpack_lun(req.lun) {
        Ok(lun) => lun,
        Err(_) => return Some(task_response::LUN_DOES_NOT_EXIST),
    };

    queue.push_task(TaskMessage::new(req.function, req.itt, req.referenced_task_tag, lun, owner));
    None
}

/// Events the target can announce with an Async Message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    ScsiEvent,
    LogoutRequest,
    DropConnection,
    DropAllConnections,
    Renegotiate,
    VendorSpecific,
}

impl FromStr for AsyncEvent {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scsi_async_event" => Ok(AsyncEvent::ScsiEvent),
            "logout_request" => Ok(AsyncEvent::LogoutRequest),
            "drop_connection" => Ok(AsyncEvent::DropConnection),
            "drop_all_connections" => Ok(AsyncEvent::DropAllConnections),
            "renegotiate" => Ok(AsyncEvent::Renegotiate),
            "vendor_specific" => Ok(AsyncEvent::VendorSpecific),
            _ => Err(IscsiError::Config(format!("unknown async event: {}", s))),
        }
    }
}

/// Parameters carried by Async Messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncParams {
    pub logout_timeout: u16,
    pub drop_time2wait: u16,
    pub drop_time2retain: u16,
    pub text_timeout: u16,
    pub vcode: u8,
}

impl AsyncEvent {
    /// Build the Async Message for this event on connection `cid`
    ///
    /// SCSI async events have no PDU form here and yield `None`.
    pub fn build(self, cid: u16, params: &AsyncParams) -> Option<IscsiPdu> {
        let lun = pack_lun(0);
        let pdu = match self {
            AsyncEvent::ScsiEvent => {
                log::warn!("SCSI async events are not generated");
                return None;
            }
            AsyncEvent::LogoutRequest => {
                IscsiPdu::async_message(lun, async_event::LOGOUT_REQUEST, 0, 0, 0, params.logout_timeout)
            }
            AsyncEvent::DropConnection => IscsiPdu::async_message(
                lun,
                async_event::DROP_CONNECTION,
                0,
                cid,
                params.drop_time2wait,
                params.drop_time2retain,
            ),
            AsyncEvent::DropAllConnections => IscsiPdu::async_message(
                lun,
                async_event::DROP_ALL_CONNECTIONS,
                0,
                0,
                params.drop_time2wait,
                params.drop_time2retain,
            ),
            AsyncEvent::Renegotiate => {
                IscsiPdu::async_message(lun, async_event::RENEGOTIATE, 0, 0, 0, params.text_timeout)
            }
            AsyncEvent::VendorSpecific => {
                IscsiPdu::async_message(lun, async_event::VENDOR_SPECIFIC, params.vcode, 0, 0, 0)
            }
        };
        Some(pdu)
    }
}

/// Asynchronous event notification from the SCSI layer; logged only
pub fn aen_notify(target: usize, lun: u16, sense: &[u8]) {
    log::info!(
        "async event notification for target {} LUN {} ({} sense bytes)",
        target,
        lun,
        sense.len()
    );
}
