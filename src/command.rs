//! SCSI command records and the execution pass
//!
//! Commands are queued per session in CmdSN order. One call to
//! [`CommandQueue::run_pass`] drains the calling connection's entries from
//! the task-management FIFO, then walks the queue and moves every command
//! owned by that connection as far through its lifecycle as it can go:
//!
//! ```text
//! NEW -> PENDING -> TO_PROCESS -> DONE -> HANDED -> DEQUEUE
//! NEW -> DONE -> HANDED -> DEQUEUE
//! any -> DEQUEUE                      (aborted / released)
//! ```

use crate::lun::LunMatrix;
use crate::scsi::{data_phase, DataDirection, Dispatch, ScsiHandler, ScsiResponse, SgList};
use crate::task::TaskMessage;
use std::collections::VecDeque;

/// Identifies the connection a command or TMF arrived on
pub type OwnerId = u64;

/// Lifecycle state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    New,
    /// Waiting for write data from the initiator
    Pending,
    /// All write data present
    ToProcess,
    Done,
    /// Response handed to the connection
    Handed,
    Dequeue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCode {
    Open,
    Aborted,
    Released,
}

/// A queued SCSI command
#[derive(Debug)]
pub struct Command {
    pub id: u32,
    pub itt: u32,
    pub cmd_sn: u32,
    pub cdb: [u8; 16],
    pub target: usize,
    pub lun: u16,
    /// LUN field as it appeared on the wire
    pub raw_lun: u64,
    pub direction: DataDirection,
    pub expected_length: u32,
    pub state: CommandState,
    pub abort: AbortCode,
    pub owner: OwnerId,
    buffer: SgList,
    /// Write bytes received so far
    received: u32,
    /// Write bytes the initiator may send (unsolicited + R2T grants)
    granted: u32,
    r2t_outstanding: bool,
    r2t_sn: u32,
    response: Option<ScsiResponse>,
}

impl Command {
    /// Build a command record; `unsolicited` is the number of write bytes
    /// the initiator may send without an R2T (immediate data included)
    pub fn new(
        itt: u32,
        cmd_sn: u32,
        cdb: [u8; 16],
        target: usize,
        lun: u16,
        raw_lun: u64,
        expected_length: u32,
        unsolicited: u32,
        owner: OwnerId,
    ) -> Self {
        let (direction, phase_len) = data_phase(&cdb);
        let buffer = if direction == DataDirection::Write {
            SgList::with_len(phase_len.min(expected_length) as usize)
        } else {
            SgList::default()
        };

        Command {
            id: 0,
            itt,
            cmd_sn,
            cdb,
            target,
            lun,
            raw_lun,
            direction,
            expected_length,
            state: CommandState::New,
            abort: AbortCode::Open,
            owner,
            buffer,
            received: 0,
            granted: unsolicited.min(expected_length),
            r2t_outstanding: false,
            r2t_sn: 0,
            response: None,
        }
    }

    /// Target transfer tag used on this command's R2Ts
    pub fn ttt(&self) -> u32 {
        self.id
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Store write data at `offset`
    pub fn add_data(&mut self, offset: u32, data: &[u8]) {
        let stored = self.buffer.write_at(offset as usize, data);
        if stored < data.len() {
            log::warn!(
                "ITT {:#x}: {} bytes past the end of the write buffer dropped",
                self.itt,
                data.len() - stored
            );
        }
        self.received = self.received.saturating_add(data.len() as u32);
        if self.received >= self.granted {
            self.r2t_outstanding = false;
        }
    }

    fn write_complete(&self) -> bool {
        self.received as usize >= self.buffer.len()
    }
}

/// Something a pass produced for the owning connection to send
#[derive(Debug, Clone)]
pub enum Outcome {
    R2T {
        itt: u32,
        raw_lun: u64,
        ttt: u32,
        r2t_sn: u32,
        offset: u32,
        length: u32,
    },
    Response {
        itt: u32,
        raw_lun: u64,
        direction: DataDirection,
        expected_length: u32,
        response: ScsiResponse,
    },
    TaskResponse {
        itt: u32,
        response: u8,
    },
}

/// Per-session command queue plus task-management FIFO
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
    tasks: VecDeque<TaskMessage>,
    next_id: u32,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        // 0 and the reserved tag are never handed out
        if self.next_id == 0 || self.next_id == crate::pdu::RESERVED_TAG {
            self.next_id = 1;
        }
        self.next_id
    }

    /// Append a command, returning its id
    pub fn enqueue(&mut self, mut cmd: Command) -> u32 {
        cmd.id = self.allocate_id();
        log::debug!(
            "queued command id={} ITT={:#x} CmdSN={} opcode={:#04x} LUN={}",
            cmd.id,
            cmd.itt,
            cmd.cmd_sn,
            cmd.cdb[0],
            cmd.lun
        );
        let id = cmd.id;
        self.commands.push(cmd);
        id
    }

    pub fn push_task(&mut self, msg: TaskMessage) {
        self.tasks.push_back(msg);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn find(&self, itt: u32) -> Option<&Command> {
        self.commands
            .iter()
            .find(|c| c.itt == itt && c.state != CommandState::Dequeue)
    }

    pub fn find_mut(&mut self, itt: u32) -> Option<&mut Command> {
        self.commands
            .iter_mut()
            .find(|c| c.itt == itt && c.state != CommandState::Dequeue)
    }

    pub fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    /// Commands not yet dequeued
    pub fn in_flight(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| c.state != CommandState::Dequeue)
            .count()
    }

    /// Mark every command of one owner (or all, with `None`) released
    pub fn release(&mut self, owner: Option<OwnerId>) -> usize {
        let mut count = 0;
        for cmd in self
            .commands
            .iter_mut()
            .filter(|c| owner.map_or(true, |o| c.owner == o))
        {
            if cmd.abort == AbortCode::Open {
                cmd.abort = AbortCode::Released;
                count += 1;
            }
        }
        self.tasks.retain(|t| owner.map_or(false, |o| t.owner != o));
        count
    }

    /// Run one execution pass on behalf of `owner`
    pub fn run_pass(&mut self, luns: &mut LunMatrix, owner: OwnerId, max_burst_length: u32) -> Vec<Outcome> {
        let mut outcomes = Vec::new();

        // Only the issuing connection may answer a task-management request
        let (mine, theirs): (VecDeque<_>, VecDeque<_>) =
            std::mem::take(&mut self.tasks).into_iter().partition(|t| t.owner == owner);
        self.tasks = theirs;

        for msg in mine {
            let response = msg.execute(&mut self.commands);
            log::info!(
                "task management function {} (ITT {:#x}) -> response {}",
                msg.function,
                msg.itt,
                response
            );
            outcomes.push(Outcome::TaskResponse {
                itt: msg.itt,
                response,
            });
        }

        for cmd in self.commands.iter_mut() {
            if cmd.abort != AbortCode::Open && cmd.state != CommandState::Dequeue {
                log::debug!("command id={} ({:?}) dropped without response", cmd.id, cmd.abort);
                cmd.state = CommandState::Dequeue;
                continue;
            }
            if cmd.owner != owner {
                continue;
            }
            Self::advance(cmd, luns, max_burst_length, &mut outcomes);
        }

        self.commands.retain(|cmd| {
            if cmd.state != CommandState::Dequeue {
                return true;
            }
            if cmd.owner != owner {
                log::warn!(
                    "command id={} owned by connection {} left in queue by connection {}",
                    cmd.id,
                    cmd.owner,
                    owner
                );
                return true;
            }
            false
        });

        outcomes
    }

    fn advance(cmd: &mut Command, luns: &mut LunMatrix, max_burst_length: u32, outcomes: &mut Vec<Outcome>) {
        loop {
            match cmd.state {
                CommandState::New => {
                    let fault = luns
                        .entry(cmd.target, cmd.lun as usize)
                        .ok()
                        .and_then(|e| e.fault());
                    if let Some(fault) = fault {
                        log::info!("command id={} failed by injected fault {:?}", cmd.id, fault);
                        cmd.response = Some(ScsiResponse::from_fault(fault));
                        cmd.state = CommandState::Done;
                        continue;
                    }

                    match ScsiHandler::handle_command(&cmd.cdb, luns, cmd.target, cmd.lun, None) {
                        Dispatch::Complete(resp) => {
                            cmd.response = Some(resp);
                            cmd.state = CommandState::Done;
                        }
                        Dispatch::NeedData { length } => {
                            if (cmd.buffer.len() as u32) < length {
                                log::warn!(
                                    "command id={} expects {} bytes but transfer length is {}",
                                    cmd.id,
                                    length,
                                    cmd.buffer.len()
                                );
                            }
                            cmd.state = if cmd.write_complete() {
                                CommandState::ToProcess
                            } else {
                                CommandState::Pending
                            };
                        }
                    }
                }
                CommandState::Pending => {
                    if cmd.write_complete() {
                        cmd.state = CommandState::ToProcess;
                        continue;
                    }
                    let total = cmd.buffer.len() as u32;
                    if !cmd.r2t_outstanding && cmd.received >= cmd.granted && cmd.granted < total {
                        let length = (total - cmd.granted).min(max_burst_length.max(1));
                        outcomes.push(Outcome::R2T {
                            itt: cmd.itt,
                            raw_lun: cmd.raw_lun,
                            ttt: cmd.ttt(),
                            r2t_sn: cmd.r2t_sn,
                            offset: cmd.granted,
                            length,
                        });
                        log::debug!(
                            "R2T #{} for command id={}: offset {} length {}",
                            cmd.r2t_sn,
                            cmd.id,
                            cmd.granted,
                            length
                        );
                        cmd.r2t_sn += 1;
                        cmd.granted += length;
                        cmd.r2t_outstanding = true;
                    }
                    return;
                }
                CommandState::ToProcess => {
                    let dispatch =
                        ScsiHandler::handle_command(&cmd.cdb, luns, cmd.target, cmd.lun, Some(&cmd.buffer));
                    cmd.response = Some(match dispatch {
                        Dispatch::Complete(resp) => resp,
                        // The buffer is present, so this only happens if the
                        // handler disagrees about the direction
                        Dispatch::NeedData { .. } => {
                            ScsiResponse::check_condition(crate::scsi::SenseData::hardware_error())
                        }
                    });
                    cmd.state = CommandState::Done;
                }
                CommandState::Done => {
                    let response = cmd
                        .response
                        .take()
                        .unwrap_or_else(|| ScsiResponse::check_condition(crate::scsi::SenseData::hardware_error()));
                    outcomes.push(Outcome::Response {
                        itt: cmd.itt,
                        raw_lun: cmd.raw_lun,
                        direction: cmd.direction,
                        expected_length: cmd.expected_length,
                        response,
                    });
                    cmd.state = CommandState::Handed;
                }
                CommandState::Handed => {
                    cmd.buffer = SgList::default();
                    cmd.state = CommandState::Dequeue;
                }
                CommandState::Dequeue => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{scsi_status, task_function, task_response};
    use crate::scsi::sense_key;

    const OWNER: OwnerId = 7;

    fn cdb10(op: u8, lba: u32, blocks: u16) -> [u8; 16] {
        let mut cdb = [0u8; 16];
        cdb[0] = op;
        cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        cdb
    }

    fn write_cmd(itt: u32, lba: u32, blocks: u16, unsolicited: u32) -> Command {
        Command::new(itt, itt, cdb10(0x2A, lba, blocks), 0, 0, 0, blocks as u32 * 512, unsolicited, OWNER)
    }

    #[test]
    fn test_ids_skip_zero() {
        let mut queue = CommandQueue::new();
        queue.next_id = u32::MAX - 1;
        let a = queue.enqueue(write_cmd(1, 0, 1, 0));
        let b = queue.enqueue(write_cmd(2, 0, 1, 0));
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_read_completes_in_one_pass() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::new(0x10, 1, cdb10(0x28, 0, 2), 0, 0, 0, 1024, 0, OWNER));

        let out = queue.run_pass(&mut luns, OWNER, 65536);
        assert_eq!(out.len(), 1);
        match &out[0] {
            Outcome::Response { itt, response, direction, .. } => {
                assert_eq!(*itt, 0x10);
                assert_eq!(*direction, DataDirection::Read);
                assert_eq!(response.data.len(), 1024);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_write_with_r2t_grants() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(write_cmd(0x20, 0, 4, 0));

        let out = queue.run_pass(&mut luns, OWNER, 1024);
        match &out[..] {
            [Outcome::R2T { offset, length, r2t_sn, .. }] => {
                assert_eq!((*offset, *length, *r2t_sn), (0, 1024, 0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.find(0x20).unwrap().state, CommandState::Pending);

        // No new R2T until the outstanding one is satisfied
        assert!(queue.run_pass(&mut luns, OWNER, 1024).is_empty());

        queue.find_mut(0x20).unwrap().add_data(0, &[1u8; 1024]);
        let out = queue.run_pass(&mut luns, OWNER, 1024);
        assert!(matches!(out[..], [Outcome::R2T { offset: 1024, length: 1024, r2t_sn: 1, .. }]));

        queue.find_mut(0x20).unwrap().add_data(1024, &[2u8; 1024]);
        let out = queue.run_pass(&mut luns, OWNER, 1024);
        match &out[..] {
            [Outcome::Response { response, .. }] => assert!(response.is_good()),
            other => panic!("unexpected {:?}", other),
        }

        let mut check = vec![0u8; 2048];
        luns.entry(0, 0).unwrap().read(0, &mut check).unwrap();
        assert!(check[..1024].iter().all(|&b| b == 1));
        assert!(check[1024..].iter().all(|&b| b == 2));
    }

    #[test]
    fn test_write_with_immediate_data() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        let mut cmd = write_cmd(0x30, 3, 1, 512);
        cmd.add_data(0, &[0xAB; 512]);
        queue.enqueue(cmd);

        let out = queue.run_pass(&mut luns, OWNER, 65536);
        assert!(matches!(out[..], [Outcome::Response { itt: 0x30, .. }]));
        assert_eq!(luns.entry(0, 0).unwrap().last_lba, 3);
    }

    #[test]
    fn test_injected_fault_short_circuits() {
        let mut luns = LunMatrix::new();
        luns.set_device_failure_state(0, 0, scsi_status::CHECK_CONDITION, sense_key::MEDIUM_ERROR, 0x11, 0)
            .unwrap();
        let mut queue = CommandQueue::new();
        queue.enqueue(write_cmd(0x40, 0, 1, 0));

        let out = queue.run_pass(&mut luns, OWNER, 65536);
        match &out[..] {
            [Outcome::Response { response, .. }] => {
                assert_eq!(response.status, scsi_status::CHECK_CONDITION);
                assert_eq!(response.sense.as_ref().unwrap().sense_key, sense_key::MEDIUM_ERROR);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_abort_pending_write() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(write_cmd(0x50, 0, 1, 0));
        queue.run_pass(&mut luns, OWNER, 65536);

        queue.push_task(TaskMessage::new(task_function::ABORT_TASK, 0x99, 0x50, 0, OWNER));
        let out = queue.run_pass(&mut luns, OWNER, 65536);
        match &out[..] {
            [Outcome::TaskResponse { itt, response }] => {
                assert_eq!(*itt, 0x99);
                assert_eq!(*response, task_response::FUNCTION_COMPLETE);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_foreign_dequeue_left_in_place() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(write_cmd(0x60, 0, 1, 0));
        queue.release(None);

        queue.run_pass(&mut luns, OWNER + 1, 65536);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.in_flight(), 0);

        queue.run_pass(&mut luns, OWNER, 65536);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_task_answered_by_issuing_connection() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(write_cmd(0x70, 0, 1, 0));
        queue.run_pass(&mut luns, OWNER, 65536);

        queue.push_task(TaskMessage::new(task_function::ABORT_TASK, 0x71, 0x70, 0, OWNER));
        let other = queue.run_pass(&mut luns, OWNER + 1, 65536);
        assert!(!other.iter().any(|o| matches!(o, Outcome::TaskResponse { .. })));
        assert_eq!(queue.find(0x70).unwrap().abort, AbortCode::Open);

        let out = queue.run_pass(&mut luns, OWNER, 65536);
        match &out[..] {
            [Outcome::TaskResponse { itt, response }] => {
                assert_eq!(*itt, 0x71);
                assert_eq!(*response, task_response::FUNCTION_COMPLETE);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_release_drops_queued_tasks() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.push_task(TaskMessage::new(task_function::TARGET_WARM_RESET, 0x80, 0, 0, OWNER));
        queue.push_task(TaskMessage::new(task_function::TARGET_WARM_RESET, 0x81, 0, 0, OWNER + 1));
        queue.release(Some(OWNER));

        assert!(queue.run_pass(&mut luns, OWNER, 65536).is_empty());
        let out = queue.run_pass(&mut luns, OWNER + 1, 65536);
        assert!(matches!(&out[..], [Outcome::TaskResponse { itt: 0x81, .. }]));
    }

    #[test]
    fn test_other_owner_untouched() {
        let mut luns = LunMatrix::new();
        let mut queue = CommandQueue::new();
        queue.enqueue(Command::new(1, 1, cdb10(0x28, 0, 1), 0, 0, 0, 512, 0, OWNER));
        assert!(queue.run_pass(&mut luns, OWNER + 1, 65536).is_empty());
        assert_eq!(queue.find(1).unwrap().state, CommandState::New);
    }
}
