use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanCmd {
    Run,
    Abort,
}

/// Broadcast channel for scan commands: every receiver sees every posted command.
#[derive(Clone)]
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, ScanCmd)>>, // (msg_num, cmd)
    condvar: Arc<Condvar>,
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, ScanCmd::Run))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // A new receiver only reacts to messages posted after its creation
        let (msg_num, _cmd) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, cmd: ScanCmd) {
        let mut guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }

    pub fn abort(&self) {
        self.send(ScanCmd::Abort)
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, ScanCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Blocks until the next command is posted.
    pub fn recv(&mut self) -> Result<ScanCmd> {
        let mut guard = self.cmd.lock();
        let posted = guard.0;
        if posted == self.viewed_msg_num {
            self.condvar.wait(&mut guard);
        } else if posted != self.viewed_msg_num + 1 {
            return Err(Error::CmdDiverged {
                viewed: self.viewed_msg_num,
                posted,
            });
        }
        self.viewed_msg_num += 1;
        Ok(guard.1)
    }

    /// The latest command if any was posted since the last look, without blocking.
    pub fn try_recv(&mut self) -> Option<ScanCmd> {
        let guard = self.cmd.lock();
        let (posted, cmd) = *guard;
        if posted == self.viewed_msg_num {
            return None;
        }
        self.viewed_msg_num = posted;
        Some(cmd)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn try_recv_sees_latest() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.try_recv(), None);
        chan.send(ScanCmd::Run);
        chan.abort();
        assert_eq!(recvr.try_recv(), Some(ScanCmd::Abort));
        assert_eq!(recvr.try_recv(), None);
    }

    #[test]
    fn late_receiver_ignores_old_messages() {
        let chan = CmdChan::new();
        chan.abort();
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.try_recv(), None);
    }

    #[test]
    fn recv_blocks_until_posted() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        let sender = chan.clone();
        let handle = thread::spawn(move || recvr.recv());
        thread::sleep(std::time::Duration::from_millis(20));
        sender.abort();
        assert_eq!(handle.join().unwrap().unwrap(), ScanCmd::Abort);
    }

    #[test]
    fn recv_detects_divergence() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        chan.abort();
        chan.abort();
        assert!(matches!(recvr.recv(), Err(Error::CmdDiverged { viewed: 0, posted: 2 })));
    }
}
