//! Queue pair and memory region lifecycle.
//!
//! Resources are held in structs whose fields are declared in reverse
//! acquisition order, so dropping a struct releases them in the mirror of
//! setup. A setup that fails part way drops only the locals it already
//! acquired, newest first.

use std::sync::Arc;

use tracing::debug;

use crate::config::RdmaConfig;
use crate::context::RemoteBuffer;
use crate::error::Result;
use crate::state::Role;
use crate::verbs::{
    AccessFlags, CmId, CompChannel, CompletionQueue, MemoryRegion, ProtectionDomain, QpCap,
    QpInitAttr, QueuePair, RecvWr, SendOp, SendWr, Sge,
};
use crate::wire::DESCRIPTOR_LEN;

/// Cookie of the control receive.
pub const RECV_WR_ID: u64 = 1;
/// Cookie of the control send.
pub const SEND_WR_ID: u64 = 2;
/// Cookie of RDMA reads and writes.
pub const RDMA_WR_ID: u64 = 3;

/// Verbs objects backing one connection's queue pair.
#[derive(Debug)]
pub struct QpResources {
    /// Reliable-connected queue pair.
    pub qp: Arc<dyn QueuePair>,
    /// Completion queue shared by sends and receives.
    pub cq: Arc<dyn CompletionQueue>,
    /// Channel the completion queue reports to.
    pub channel: Arc<dyn CompChannel>,
    /// Protection domain every region is registered in.
    pub pd: Arc<dyn ProtectionDomain>,
}

impl QpResources {
    /// Allocate PD, completion channel, CQ and QP on `id`'s device.
    pub fn create(id: &Arc<dyn CmId>, config: &RdmaConfig) -> Result<Self> {
        let device = id.verbs()?;

        let pd = device.alloc_pd()?;
        debug!(pd = pd.handle(), device = device.name(), "created pd");

        let channel = device.create_comp_channel()?;
        debug!(channel = channel.handle(), "created channel");

        let cq = device.create_cq(config.cq_depth(), &channel)?;
        debug!(cq = cq.handle(), cqe = config.cq_depth(), "created cq");
        cq.req_notify()?;

        let attr = QpInitAttr {
            send_cq: cq.clone(),
            recv_cq: cq.clone(),
            cap: QpCap {
                max_send_wr: config.sq_depth,
                max_recv_wr: config.recv_depth,
                max_send_sge: 1,
                max_recv_sge: 1,
            },
        };
        let qp = id.create_qp(&pd, &attr)?;
        debug!(qp_num = qp.qp_num(), "created qp");

        Ok(Self {
            qp,
            cq,
            channel,
            pd,
        })
    }
}

/// Registered buffers of one connection.
#[derive(Debug)]
pub struct BufferSet {
    /// Client-side staging buffer advertised for passive reads.
    pub start: Option<Arc<dyn MemoryRegion>>,
    /// Bulk buffer targeted by the peer's RDMA operations.
    pub rdma: Arc<dyn MemoryRegion>,
    /// Outgoing descriptor.
    pub send: Arc<dyn MemoryRegion>,
    /// Incoming descriptor.
    pub recv: Arc<dyn MemoryRegion>,
}

impl BufferSet {
    /// Register the control buffers, the bulk buffer and, for a client, the staging buffer.
    pub fn register(pd: &Arc<dyn ProtectionDomain>, role: Role, size: usize) -> Result<Self> {
        let bulk = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;

        let recv = pd.reg_mr(DESCRIPTOR_LEN, AccessFlags::LOCAL_WRITE)?;
        let send = pd.reg_mr(DESCRIPTOR_LEN, AccessFlags::empty())?;
        let rdma = pd.reg_mr(size, bulk)?;
        debug!(
            rkey = format_args!("{:#x}", rdma.rkey()),
            addr = format_args!("{:#x}", rdma.addr()),
            size,
            "registered rdma buffer"
        );
        let start = match role {
            Role::Client => {
                let start = pd.reg_mr(size, bulk)?;
                debug!(
                    rkey = format_args!("{:#x}", start.rkey()),
                    addr = format_args!("{:#x}", start.addr()),
                    "registered start buffer"
                );
                Some(start)
            }
            Role::Server => None,
        };

        Ok(Self {
            start,
            rdma,
            send,
            recv,
        })
    }

    /// Buffer this side advertises for the given direction: the staging
    /// buffer for a client's passive read, the bulk buffer otherwise.
    pub fn advertised(&self, for_read: bool) -> &Arc<dyn MemoryRegion> {
        match (&self.start, for_read) {
            (Some(start), true) => start,
            _ => &self.rdma,
        }
    }
}

/// Work request templates built once per connection.
#[derive(Debug, Clone, Copy)]
pub struct WorkRequests {
    recv: RecvWr,
    send: SendWr,
    rdma_sge: Sge,
}

impl WorkRequests {
    /// Build the templates over `bufs`.
    pub fn new(bufs: &BufferSet) -> Self {
        let recv = RecvWr {
            wr_id: RECV_WR_ID,
            sge: Sge {
                addr: bufs.recv.addr(),
                length: DESCRIPTOR_LEN as u32,
                lkey: bufs.recv.lkey(),
            },
        };
        let send = SendWr {
            wr_id: SEND_WR_ID,
            sge: Sge {
                addr: bufs.send.addr(),
                length: DESCRIPTOR_LEN as u32,
                lkey: bufs.send.lkey(),
            },
            op: SendOp::Send,
            signaled: true,
        };
        let rdma_sge = Sge {
            addr: bufs.rdma.addr(),
            length: 0,
            lkey: bufs.rdma.lkey(),
        };
        Self {
            recv,
            send,
            rdma_sge,
        }
    }

    /// The control receive.
    pub fn recv(&self) -> RecvWr {
        self.recv
    }

    /// The control send.
    pub fn send(&self) -> SendWr {
        self.send
    }

    /// RDMA read of `remote` into the local bulk buffer.
    pub fn rdma_read(&self, remote: RemoteBuffer) -> SendWr {
        self.rdma(
            remote.len,
            SendOp::RdmaRead {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
        )
    }

    /// RDMA write of `len` bytes of the local bulk buffer to `remote`.
    pub fn rdma_write(&self, remote: RemoteBuffer, len: u32) -> SendWr {
        self.rdma(
            len,
            SendOp::RdmaWrite {
                remote_addr: remote.addr,
                rkey: remote.rkey,
            },
        )
    }

    fn rdma(&self, len: u32, op: SendOp) -> SendWr {
        SendWr {
            wr_id: RDMA_WR_ID,
            sge: Sge {
                length: len,
                ..self.rdma_sge
            },
            op,
            signaled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FaultPlan, ResourceEvent, ResourceKind, SimFabric};
    use crate::verbs::RdmaProvider;

    fn id(fabric: &SimFabric) -> Arc<dyn CmId> {
        fabric.create_event_channel().unwrap().create_id().unwrap()
    }

    fn released(fabric: &SimFabric) -> Vec<ResourceKind> {
        fabric
            .journal()
            .into_iter()
            .filter_map(|e| match e {
                ResourceEvent::Released(kind, _) => Some(kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_qp_resources_release_in_reverse() {
        let fabric = SimFabric::new();
        let id = id(&fabric);
        let res = QpResources::create(&id, &RdmaConfig::default()).unwrap();
        let acquired: Vec<_> = fabric
            .journal()
            .into_iter()
            .filter_map(|e| match e {
                ResourceEvent::Acquired(kind, _) => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            acquired,
            vec![
                ResourceKind::Pd,
                ResourceKind::CompChannel,
                ResourceKind::Cq,
                ResourceKind::Qp
            ]
        );
        drop(res);
        assert_eq!(
            released(&fabric),
            vec![
                ResourceKind::Qp,
                ResourceKind::Cq,
                ResourceKind::CompChannel,
                ResourceKind::Pd
            ]
        );
    }

    #[test]
    fn test_failed_cq_unwinds_channel_then_pd() {
        let fabric = SimFabric::new();
        let id = id(&fabric);
        fabric.set_faults(FaultPlan {
            fail_create_cq: true,
            ..Default::default()
        });
        assert!(QpResources::create(&id, &RdmaConfig::default()).is_err());
        assert_eq!(
            released(&fabric),
            vec![ResourceKind::CompChannel, ResourceKind::Pd]
        );
    }

    #[test]
    fn test_client_registers_four_regions() {
        let fabric = SimFabric::new();
        let res = QpResources::create(&id(&fabric), &RdmaConfig::default()).unwrap();
        let bufs = BufferSet::register(&res.pd, Role::Client, 4096).unwrap();
        assert_eq!(fabric.live_regions(), 4);
        assert_eq!(bufs.recv.len(), DESCRIPTOR_LEN);
        assert_eq!(bufs.rdma.len(), 4096);
        assert!(bufs.rdma.access().contains(AccessFlags::REMOTE_WRITE));
        assert!(!bufs.send.access().contains(AccessFlags::LOCAL_WRITE));
        let start = bufs.start.as_ref().unwrap();
        assert_eq!(bufs.advertised(true).rkey(), start.rkey());
        assert_eq!(bufs.advertised(false).rkey(), bufs.rdma.rkey());

        let server = BufferSet::register(&res.pd, Role::Server, 4096).unwrap();
        assert!(server.start.is_none());
        assert_eq!(server.advertised(true).rkey(), server.rdma.rkey());
    }

    #[test]
    fn test_partial_registration_releases_acquired_subset() {
        let fabric = SimFabric::new();
        let res = QpResources::create(&id(&fabric), &RdmaConfig::default()).unwrap();
        fabric.set_faults(FaultPlan {
            fail_reg_mr_at: Some(3),
            ..Default::default()
        });
        assert!(BufferSet::register(&res.pd, Role::Client, 4096).is_err());
        assert_eq!(fabric.live_regions(), 0);

        let mrs: Vec<_> = fabric
            .journal()
            .into_iter()
            .filter(|e| matches!(e, ResourceEvent::Acquired(ResourceKind::Mr, _) | ResourceEvent::Released(ResourceKind::Mr, _)))
            .collect();
        assert_eq!(mrs.len(), 6);
        let acquired: Vec<_> = mrs[..3]
            .iter()
            .map(|e| match e {
                ResourceEvent::Acquired(_, h) => *h,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let released: Vec<_> = mrs[3..]
            .iter()
            .map(|e| match e {
                ResourceEvent::Released(_, h) => *h,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let mut mirrored = acquired.clone();
        mirrored.reverse();
        assert_eq!(released, mirrored);
    }

    #[test]
    fn test_rdma_templates_patch_remote_fields() {
        let fabric = SimFabric::new();
        let res = QpResources::create(&id(&fabric), &RdmaConfig::default()).unwrap();
        let bufs = BufferSet::register(&res.pd, Role::Server, 4096).unwrap();
        let wrs = WorkRequests::new(&bufs);
        let remote = RemoteBuffer {
            rkey: 0x8000_0042,
            addr: 0x1000,
            len: 512,
        };
        let read = wrs.rdma_read(remote);
        assert_eq!(read.sge.length, 512);
        assert_eq!(read.sge.addr, bufs.rdma.addr());
        assert_eq!(
            read.op,
            SendOp::RdmaRead {
                remote_addr: 0x1000,
                rkey: 0x8000_0042
            }
        );
        let write = wrs.rdma_write(remote, 256);
        assert_eq!(write.sge.length, 256);
        assert_eq!(wrs.send().sge.length, DESCRIPTOR_LEN as u32);
        assert_eq!(wrs.recv().wr_id, RECV_WR_ID);
    }
}
