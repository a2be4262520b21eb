use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelResult};
use crate::physical::PhysicalCore;
use crate::shmem::ipc::{IpcNamespace, NamedSignal};
use crate::shmem::layout::{Half, RegionView};

/// Which side of the region this endpoint plays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// created the region and picked the split (server side)
    Creator,
    /// opened an existing region and mirrored the split (client side)
    Opener,
}
impl Role {
    fn outbound_half(&self) -> Half {
        match self {
            Role::Creator => Half::A,
            Role::Opener => Half::B,
        }
    }
}

fn written_signal_name(share_name: &str, half: Half) -> String {
    match half {
        Half::A => format!("{}.a.written", share_name),
        Half::B => format!("{}.b.written", share_name),
    }
}

fn read_signal_name(share_name: &str, half: Half) -> String {
    match half {
        Half::A => format!("{}.a.read", share_name),
        Half::B => format!("{}.b.read", share_name),
    }
}

/// One physical connection over a shared-memory region: fragmenting sends, blocking
///  reassembling receives, and closed-flag aware waits.
///
/// Flow control per half: the sender waits for the half's `read` signal (the peer's
///  buffer slot is free), writes one fragment, fires `written`; the receiver waits
///  for `written`, copies the fragment out, fires `read`. A logical message larger
///  than the payload capacity travels as multiple fragments with the finish flag set
///  only on the last.
pub struct ShmemConnection {
    pub core: PhysicalCore,
    view: RegionView,
    share_name: String,
    outbound: Half,
    out_written: Arc<dyn NamedSignal>,
    out_read: Arc<dyn NamedSignal>,
    in_written: Arc<dyn NamedSignal>,
    in_read: Arc<dyn NamedSignal>,
    max_message_len: usize,
}

impl ShmemConnection {
    /// Server side: create the named region, declare the split, initialize the
    ///  signals so both buffer slots start out free.
    pub fn create(
        namespace: &dyn IpcNamespace,
        share_name: &str,
        region_size: usize,
        max_message_len: usize,
    ) -> ChannelResult<ShmemConnection> {
        let region = namespace.create_region(share_name, region_size)?;
        let view = RegionView::create(region, region_size)?;

        let connection = Self::with_view(namespace, share_name, view, Role::Creator, max_message_len)?;
        // both halves start out writable
        connection.out_read.set();
        connection.in_read.set();

        debug!("created shared-memory region '{}' with {} bytes", share_name, region_size);
        Ok(connection)
    }

    /// Client side: open the region by name and mirror the creator's split.
    pub fn open(
        namespace: &dyn IpcNamespace,
        share_name: &str,
        max_message_len: usize,
    ) -> ChannelResult<ShmemConnection> {
        let region = namespace.open_region(share_name)?;
        let view = RegionView::open(region)?;

        debug!("opened shared-memory region '{}' with {} bytes", share_name, view.region_size());
        Self::with_view(namespace, share_name, view, Role::Opener, max_message_len)
    }

    fn with_view(
        namespace: &dyn IpcNamespace,
        share_name: &str,
        view: RegionView,
        role: Role,
        max_message_len: usize,
    ) -> ChannelResult<ShmemConnection> {
        let outbound = role.outbound_half();
        let inbound = outbound.other();

        Ok(ShmemConnection {
            core: PhysicalCore::new(),
            out_written: namespace.signal(&written_signal_name(share_name, outbound))?,
            out_read: namespace.signal(&read_signal_name(share_name, outbound))?,
            in_written: namespace.signal(&written_signal_name(share_name, inbound))?,
            in_read: namespace.signal(&read_signal_name(share_name, inbound))?,
            view,
            share_name: share_name.to_string(),
            outbound,
            max_message_len,
        })
    }

    pub fn share_name(&self) -> &str {
        &self.share_name
    }

    pub fn payload_capacity(&self) -> usize {
        self.view.payload_capacity()
    }

    /// Wait for a signal, failing with `ConnectionClosed` if the closed flag is set -
    ///  a wake can mean either "peer acted" or "peer is closing", and the flag decides.
    async fn wait_checked(
        &self,
        signal: &Arc<dyn NamedSignal>,
        deadline: Deadline,
    ) -> ChannelResult<()> {
        if self.view.is_closed()? {
            return Err(self.closed_error());
        }
        signal.wait(deadline).await?;
        if self.view.is_closed()? {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> ChannelError {
        ChannelError::ConnectionClosed {
            reason: format!("shared-memory region '{}' was closed by the peer", self.share_name),
        }
    }

    /// Send one logical message, splitting it into as many fragments as the half's
    ///  capacity requires. A zero-length message is legal and travels as a single
    ///  empty fragment.
    pub async fn send_bytes(&self, payload: &[u8], deadline: Deadline) -> ChannelResult<()> {
        self.core.check_not_disposed()?;
        deadline.check("shared-memory send")?;

        let capacity = self.view.payload_capacity();
        let mut offset = 0;

        loop {
            let fragment_len = std::cmp::min(capacity, payload.len() - offset);
            let finish = offset + fragment_len == payload.len();

            self.wait_checked(&self.out_read, deadline).await?;
            self.view
                .write_fragment(self.outbound, &payload[offset..offset + fragment_len], finish)?;
            self.out_written.set();

            trace!(
                "sent fragment of {} bytes on '{}' (finish: {})",
                fragment_len, self.share_name, finish
            );

            offset += fragment_len;
            if finish {
                break;
            }
        }

        self.core.renew();
        Ok(())
    }

    /// Receive one logical message, looping over fragments until the finish flag.
    pub async fn recv_bytes(&self, deadline: Deadline) -> ChannelResult<Bytes> {
        self.core.check_not_disposed()?;

        let inbound = self.outbound.other();
        let mut assembled = BytesMut::new();

        loop {
            self.wait_checked(&self.in_written, deadline).await?;

            let header = self.view.read_fragment_header(inbound)?;
            if assembled.len() + header.total_size > self.max_message_len {
                return Err(ChannelError::TooLarge {
                    size: assembled.len() + header.total_size,
                    limit: self.max_message_len,
                });
            }

            let mut fragment = vec![0u8; header.total_size];
            self.view.read_fragment_payload(inbound, &mut fragment)?;
            assembled.put_slice(&fragment);
            self.in_read.set();

            if header.finish {
                break;
            }
        }

        self.core.renew();
        Ok(assembled.freeze())
    }

    /// Tear the connection down: mark the shared closed flag and wake every blocked
    ///  waiter on both sides so they observe it.
    pub fn close(&self) -> ChannelResult<()> {
        debug!("closing shared-memory connection '{}'", self.share_name);
        self.core.dispose();
        self.view.mark_closed()?;
        self.out_written.set();
        self.out_read.set();
        self.in_written.set();
        self.in_read.set();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::shmem::ipc::InProcessNamespace;
    use rstest::*;
    use std::time::Duration;

    const MAX_MSG: usize = 64 * 1024 * 1024;

    fn pair(ns: &InProcessNamespace, name: &str, size: usize) -> (ShmemConnection, ShmemConnection) {
        let server = ShmemConnection::create(ns, name, size, MAX_MSG).unwrap();
        let client = ShmemConnection::open(ns, name, MAX_MSG).unwrap();
        (server, client)
    }

    #[rstest]
    fn test_happy_path_100_bytes() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let ns = InProcessNamespace::new();
            let (server, client) = pair(&ns, "X", 65_536);

            let payload: Vec<u8> = (0..100u8).collect();
            client
                .send_bytes(&payload, Deadline::after(Duration::from_secs(5)))
                .await.unwrap();

            // 100 bytes fit in one fragment - the finish flag is set on it
            let header = {
                use crate::shmem::layout::{Half, RegionView};
                let region = ns.open_region("X").unwrap();
                RegionView::open(region).unwrap().read_fragment_header(Half::B).unwrap()
            };
            assert_eq!(header.total_size, 100);
            assert!(header.finish);

            let received = server
                .recv_bytes(Deadline::after(Duration::from_secs(5)))
                .await.unwrap();
            assert_eq!(received.to_vec(), payload);
        });
    }

    #[rstest]
    fn test_fragmentation_boundaries() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let ns = InProcessNamespace::new();

            for (i, delta) in [None, Some(-1i64), Some(0), Some(1)].iter().enumerate() {
                let name = format!("frag-{}", i);
                let (server, client) = pair(&ns, &name, 20_000);
                let capacity = client.payload_capacity();

                let len = match delta {
                    None => 0usize,
                    Some(d) => (capacity as i64 + d) as usize,
                };
                let payload: Vec<u8> = (0..len).map(|b| (b % 251) as u8).collect();

                let sent = payload.clone();
                let client = std::sync::Arc::new(client);
                let sender = {
                    let client = client.clone();
                    tokio::spawn(async move {
                        client.send_bytes(&sent, Deadline::after(Duration::from_secs(10))).await
                    })
                };

                let received = server
                    .recv_bytes(Deadline::after(Duration::from_secs(10)))
                    .await.unwrap();
                sender.await.unwrap().unwrap();

                assert_eq!(received.len(), payload.len(), "length mismatch for delta {:?}", delta);
                assert_eq!(received.to_vec(), payload, "content mismatch for delta {:?}", delta);
            }
        });
    }

    #[rstest]
    fn test_five_times_capacity() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let ns = InProcessNamespace::new();
            let (server, client) = pair(&ns, "big", 20_000);
            let capacity = client.payload_capacity();

            let payload: Vec<u8> = (0..5 * capacity).map(|b| (b % 241) as u8).collect();
            let sent = payload.clone();
            let client = std::sync::Arc::new(client);
            let sender = {
                let client = client.clone();
                tokio::spawn(async move {
                    client.send_bytes(&sent, Deadline::after(Duration::from_secs(10))).await
                })
            };

            let received = server
                .recv_bytes(Deadline::after(Duration::from_secs(10)))
                .await.unwrap();
            sender.await.unwrap().unwrap();

            assert_eq!(received.to_vec(), payload);
        });
    }

    #[rstest]
    fn test_close_wakes_blocked_receiver() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build().unwrap();
        rt.block_on(async {
            let ns = InProcessNamespace::new();
            let (server, client) = pair(&ns, "closing", 20_000);

            let server = std::sync::Arc::new(server);
            let receiver = {
                let server = server.clone();
                tokio::spawn(async move {
                    server.recv_bytes(Deadline::after(Duration::from_secs(30))).await
                })
            };

            tokio::time::sleep(Duration::from_millis(20)).await;
            client.close().unwrap();

            let err = receiver.await.unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        });
    }

    #[rstest]
    fn test_send_after_close_fails_immediately() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let ns = InProcessNamespace::new();
            let (server, client) = pair(&ns, "closed-send", 20_000);

            server.close().unwrap();
            let err = client
                .send_bytes(&[1, 2, 3], Deadline::after(Duration::from_secs(1)))
                .await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
        });
    }
}
