//! Completion-queue event loop.
//!
//! One thread per connection blocks on the completion channel, re-arms the
//! queue and drains every ready completion before blocking again. Receives
//! carry buffer descriptors; RDMA completions finish the worker's wait.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::context::ConnContext;
use crate::error::{RdmaError, Result};
use crate::rendezvous::WakeCause;
use crate::resources::WorkRequests;
use crate::state::ConnState;
use crate::verbs::{
    CompChannel, CompletionQueue, MemoryRegion, QueuePair, WcOpcode, WcStatus, WorkCompletion,
};
use crate::wire::DESCRIPTOR_LEN;

/// Everything the completion loop touches.
pub struct CqLoop {
    ctx: Arc<ConnContext>,
    channel: Arc<dyn CompChannel>,
    cq: Arc<dyn CompletionQueue>,
    qp: Arc<dyn QueuePair>,
    recv_mr: Arc<dyn MemoryRegion>,
    wrs: WorkRequests,
}

impl CqLoop {
    /// Bundle the loop's collaborators.
    pub fn new(
        ctx: Arc<ConnContext>,
        channel: Arc<dyn CompChannel>,
        cq: Arc<dyn CompletionQueue>,
        qp: Arc<dyn QueuePair>,
        recv_mr: Arc<dyn MemoryRegion>,
        wrs: WorkRequests,
    ) -> Self {
        Self {
            ctx,
            channel,
            cq,
            qp,
            recv_mr,
            wrs,
        }
    }

    /// Start the loop on its own thread.
    pub fn spawn(self) -> Result<CqLoopHandle> {
        let channel = self.channel.clone();
        let thread = thread::Builder::new()
            .name("rdma-cq".to_string())
            .spawn(move || self.run())?;
        Ok(CqLoopHandle {
            channel,
            thread: Some(thread),
        })
    }

    /// Run until the channel is shut down or a completion fails.
    pub fn run(self) -> Result<()> {
        loop {
            let signaled = match self.channel.get_cq_event() {
                Ok(Some(cq)) => cq,
                Ok(None) => {
                    debug!(cq = self.cq.handle(), "completion channel closed");
                    return Ok(());
                }
                Err(e) => return Err(self.abort(e)),
            };
            if signaled != self.cq.handle() {
                error!(cq = signaled, expected = self.cq.handle(), "unknown cq");
                return Err(self.abort(RdmaError::UnknownCq(signaled)));
            }
            self.cq.ack_events(1);
            if let Err(e) = self.cq.req_notify() {
                return Err(self.abort(e));
            }
            if let Err(e) = self.drain() {
                return Err(self.abort(e));
            }
        }
    }

    fn abort(&self, e: RdmaError) -> RdmaError {
        error!(error = %e, "cq completion failed");
        self.ctx.fail();
        e
    }

    fn drain(&self) -> Result<()> {
        while let Some(wc) = self.cq.poll()? {
            self.handle(&wc)?;
        }
        Ok(())
    }

    fn handle(&self, wc: &WorkCompletion) -> Result<()> {
        if wc.status == WcStatus::WrFlushError {
            debug!(wr_id = wc.wr_id, opcode = ?wc.opcode, "flushed completion");
            self.ctx.metrics().inc_flushed_completions();
            return Ok(());
        }
        if wc.status != WcStatus::Success {
            return Err(RdmaError::CompletionFailed {
                status: wc.status,
                wr_id: wc.wr_id,
            });
        }

        match wc.opcode {
            WcOpcode::Send => {
                debug!(qp_num = wc.qp_num, "send completion");
            }
            WcOpcode::RdmaWrite => {
                debug!(len = wc.byte_len, "rdma write completion");
                self.ctx
                    .transition(ConnState::WriteComplete, WakeCause::WriteDone);
            }
            WcOpcode::RdmaRead => {
                debug!(len = wc.byte_len, "rdma read completion");
                self.ctx
                    .transition(ConnState::ReadComplete, WakeCause::ReadDone);
            }
            WcOpcode::Recv => {
                debug!(len = wc.byte_len, "recv completion");
                let payload = self.recv_mr.read_bytes(0, DESCRIPTOR_LEN)?;
                if let Err(e) = self.ctx.handle_advert(&payload, wc.byte_len) {
                    warn!(error = %e, "received bogus data");
                    return Err(e);
                }
                self.ctx.metrics().inc_recvs_completed();
                self.qp.post_recv(&self.wrs.recv())?;
                self.ctx.wake(WakeCause::Advert);
            }
            other => return Err(RdmaError::UnknownOpcode(other)),
        }
        Ok(())
    }
}

/// Running completion loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct CqLoopHandle {
    channel: Arc<dyn CompChannel>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl CqLoopHandle {
    /// Shut the channel down and wait for the thread.
    pub fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.channel.shutdown();
        match thread.join() {
            Ok(Ok(())) => debug!("cq loop stopped"),
            Ok(Err(e)) => info!(error = %e, "cq loop had terminated"),
            Err(_) => error!("cq loop panicked"),
        }
    }

    /// True while the loop thread is still running.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for CqLoopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
