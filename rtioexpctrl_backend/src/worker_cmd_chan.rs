use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::error::{Result, RunError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    /// Stream the compiled events this many times
    Stream(usize),
    Close,
}

/// Broadcast channel for worker commands: every receiver sees every command once.
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num: usize, worker_cmd: WorkerCmd)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Close))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // A receiver created after some commands were posted reacts from `msg_num + 1` on
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, cmd: WorkerCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Blocks until the next command is posted.
    ///
    /// Fails if more than one command was posted since the last call: the sender must
    /// wait for the workers to acknowledge a command before posting the next one.
    pub fn recv(&mut self) -> Result<WorkerCmd> {
        let mut mutex_guard = self.cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut mutex_guard);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        if msg_num != self.viewed_msg_num + 1 {
            return Err(RunError::Worker(format!(
                "viewed msg count {} diverged from the published command number {}",
                self.viewed_msg_num, msg_num
            )));
        }
        self.viewed_msg_num += 1;
        Ok(cmd_val)
    }
}
