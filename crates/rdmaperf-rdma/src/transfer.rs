//! The eight transfer handlers, one per (role, mode) pair.
//!
//! Passive handlers advertise a local buffer and wait for the peer's
//! go-ahead. Active handlers wait for the peer's advertisement, perform
//! the RDMA operation and send the go-ahead. Client-active and
//! server-passive combinations are reserved and do nothing.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::context::RemoteBuffer;
use crate::control::{ConnectionControl, DataPath};
use crate::error::{RdmaError, Result};
use crate::rendezvous::WakeCause;
use crate::state::{ConnState, Role};
use crate::verbs::MemoryRegion;
use crate::wire::{BufferDescriptor, TransferMode};

impl ConnectionControl {
    fn send_descriptor(
        &self,
        path: &DataPath<'_>,
        mr: &Arc<dyn MemoryRegion>,
        size: u32,
        mode: TransferMode,
    ) -> Result<()> {
        let desc = BufferDescriptor::new(mr.addr(), mr.rkey(), size, mode);
        path.bufs.send.write_bytes(0, &desc.encode())?;
        path.qp.post_send(&path.wrs.send())?;
        self.ctx().metrics().inc_sends_posted();
        debug!(
            rkey = format_args!("{:#x}", desc.rkey),
            addr = format_args!("{:#x}", desc.addr),
            len = desc.size,
            %mode,
            "rdma addr/rkey/len sent"
        );
        Ok(())
    }

    fn local_size(&self) -> u32 {
        // validated to fit the wire field
        self.config().size as u32
    }

    fn check_capacity(path: &DataPath<'_>, remote: RemoteBuffer) -> Result<()> {
        let capacity = path.bufs.rdma.len();
        if remote.len as usize > capacity {
            return Err(RdmaError::RemoteTooLarge {
                remote_len: remote.len,
                capacity,
            });
        }
        Ok(())
    }

    /// Advertise the staging buffer for the server to read, then wait for its go-ahead.
    pub fn client_passive_read(&self) -> Result<usize> {
        let path = self.data_path()?;
        let ctx = self.ctx();
        ctx.ensure_live(ConnState::WriteAdv)?;
        ctx.state_cell().set(ConnState::ReadAdv);
        let start = path.bufs.advertised(true);
        self.send_descriptor(&path, start, self.local_size(), TransferMode::PassiveRead)?;
        ctx.await_state(WakeCause::Advert, ConnState::WriteAdv)?;
        Ok(self.config().size)
    }

    /// Advertise the bulk buffer for the server to write, then wait for its go-ahead.
    pub fn client_passive_write(&self) -> Result<usize> {
        let path = self.data_path()?;
        let ctx = self.ctx();
        ctx.ensure_live(ConnState::WriteComplete)?;
        ctx.state_cell().set(ConnState::WriteAdv);
        let rdma = path.bufs.advertised(false);
        self.send_descriptor(&path, rdma, self.local_size(), TransferMode::PassiveWrite)?;
        ctx.await_state(WakeCause::Advert, ConnState::WriteComplete)?;
        Ok(self.config().size)
    }

    /// Reserved.
    pub fn client_active_read(&self) -> Result<usize> {
        debug!("client active read is a no-op");
        Ok(0)
    }

    /// Reserved.
    pub fn client_active_write(&self) -> Result<usize> {
        debug!("client active write is a no-op");
        Ok(0)
    }

    /// Wait for the client's buffer, RDMA-read it, echo it and send the go-ahead.
    ///
    /// Returns the length the client advertised.
    pub fn server_active_read(&self) -> Result<usize> {
        let path = self.data_path()?;
        let ctx = self.ctx();
        ctx.await_cause(WakeCause::Advert, ConnState::ReadAdv)?;
        let remote = ctx.remote();
        Self::check_capacity(&path, remote)?;

        path.qp.post_send(&path.wrs.rdma_read(remote))?;
        ctx.metrics().inc_rdma_reads_posted();
        debug!(
            rkey = format_args!("{:#x}", remote.rkey),
            addr = format_args!("{:#x}", remote.addr),
            len = remote.len,
            "server posted rdma read req"
        );
        ctx.await_state(WakeCause::ReadDone, ConnState::ReadComplete)?;
        debug!("server received read complete");

        if self.echo.is_enabled() {
            let data = path.bufs.rdma.read_bytes(0, remote.len as usize)?;
            self.echo.echo(&data);
        }

        self.send_descriptor(&path, &path.bufs.rdma, self.local_size(), TransferMode::ActiveRead)?;
        debug!("server rdma read end");
        Ok(remote.len as usize)
    }

    /// Wait for the client's buffer, RDMA-write into it and send the go-ahead.
    ///
    /// A descriptor that already arrived is consumed directly; otherwise the
    /// handler blocks until it does. Returns the length the client advertised.
    pub fn server_active_write(&self) -> Result<usize> {
        let path = self.data_path()?;
        let ctx = self.ctx();
        ctx.ensure_live(ConnState::WriteAdv)?;
        if ctx.state_cell().begin_write_wait() {
            debug!("descriptor already received");
        }
        ctx.await_cause(WakeCause::Advert, ConnState::WriteAdv)?;
        let found = ctx.state();
        if found != ConnState::WriteAdv {
            return Err(RdmaError::StateMismatch {
                expected: ConnState::WriteAdv,
                found,
            });
        }
        let remote = ctx.remote();
        Self::check_capacity(&path, remote)?;

        path.qp.post_send(&path.wrs.rdma_write(remote, remote.len))?;
        ctx.metrics().inc_rdma_writes_posted();
        debug!(
            rkey = format_args!("{:#x}", remote.rkey),
            addr = format_args!("{:#x}", remote.addr),
            len = remote.len,
            "server posted rdma write req"
        );
        ctx.await_state(WakeCause::WriteDone, ConnState::WriteComplete)?;
        debug!("server rdma write complete");

        self.send_descriptor(&path, &path.bufs.rdma, self.local_size(), TransferMode::ActiveWrite)?;
        Ok(remote.len as usize)
    }

    /// Reserved.
    pub fn server_passive_read(&self) -> Result<usize> {
        debug!("server passive read is a no-op");
        Ok(0)
    }

    /// Reserved.
    pub fn server_passive_write(&self) -> Result<usize> {
        debug!("server passive write is a no-op");
        Ok(0)
    }

    /// Run the handler for this side's role and current transfer mode.
    pub fn transfer(&self) -> Result<usize> {
        let mode = self.ctx().trans_mode();
        match (self.role(), mode) {
            (Role::Client, TransferMode::PassiveRead) => self.client_passive_read(),
            (Role::Client, TransferMode::PassiveWrite) => self.client_passive_write(),
            (Role::Client, TransferMode::ActiveRead) => self.client_active_read(),
            (Role::Client, TransferMode::ActiveWrite) => self.client_active_write(),
            (Role::Server, TransferMode::ActiveRead) => self.server_active_read(),
            (Role::Server, TransferMode::ActiveWrite) => self.server_active_write(),
            (Role::Server, TransferMode::PassiveRead) => self.server_passive_read(),
            (Role::Server, TransferMode::PassiveWrite) => self.server_passive_write(),
        }
    }

    /// [`ConnectionControl::transfer`] with the result folded into bytes
    /// transferred or a negative error code, and recorded in the metrics.
    pub fn run_transfer(&self) -> i64 {
        let metrics = self.ctx().metrics();
        match self.transfer() {
            Ok(bytes) => {
                metrics.transfer_completed(bytes as u64);
                info!(role = %self.role(), mode = %self.ctx().trans_mode(), bytes, "transfer complete");
                bytes as i64
            }
            Err(e) => {
                metrics.transfer_failed();
                warn!(role = %self.role(), error = %e, state = %self.state(), "transfer failed");
                i64::from(e.code())
            }
        }
    }
}
