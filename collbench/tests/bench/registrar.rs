use collbench::channel::{DirectChannel, DirectEpoch};
use collbench::comm::{Communicator, HandleState};
use collbench::device::{HostPlatform, Platform};
use collbench::{BenchError, Transport};
use std::sync::Arc;
use std::time::Duration;

use super::helpers::run_ranks;

#[tokio::test]
async fn test_handles_resolve_only_after_setup() {
    run_ranks(2, |boot| async move {
        let comm = Communicator::new(boot);
        let peer = 1 - comm.rank();
        let buf = HostPlatform::new(1).alloc(0, 64).unwrap();
        let mem = comm
            .register_memory(&buf, Transport::LocalFastPath.into())
            .unwrap();

        let conn = comm.connect(peer, 7, Transport::LocalFastPath).unwrap();
        let handle = comm.exchange_memory(peer, 7, &mem).unwrap();
        assert_eq!(handle.state(), HandleState::Pending);
        assert!(matches!(
            handle.get(),
            Err(BenchError::SetupPending { .. })
        ));
        assert!(!conn.is_ready());

        comm.finalize_setup().await.unwrap();

        assert_eq!(handle.state(), HandleState::Resolved);
        let remote = handle.get().unwrap();
        assert_eq!(remote.owner, peer);
        assert_eq!(remote.len, 64);
        assert!(conn.is_ready());
        assert_eq!(conn.remote_transport().unwrap(), Transport::LocalFastPath);
    })
    .await;
}

#[tokio::test]
async fn test_put_then_signal_lands_in_peer_buffer() {
    run_ranks(2, |boot| async move {
        let comm = Communicator::new(boot);
        let rank = comm.rank();
        let peer = 1 - rank;
        let buf = HostPlatform::new(1).alloc(0, 64).unwrap();
        let mem = comm
            .register_memory(&buf, Transport::LocalFastPath.into())
            .unwrap();
        let conn = comm.connect(peer, 0, Transport::LocalFastPath).unwrap();
        let handle = comm.exchange_memory(peer, 0, &mem).unwrap();
        comm.finalize_setup().await.unwrap();

        if rank == 0 {
            buf.write_i32(0, &[10, 20, 30, 40]).unwrap();
            conn.put(handle.get().unwrap(), 16, &buf, 0, 16).await.unwrap();
            conn.signal().await.unwrap();
        } else {
            conn.inbound().wait_for(1).await.unwrap();
            assert_eq!(buf.read_i32(4, 4).unwrap(), vec![10, 20, 30, 40]);
            assert_eq!(buf.read_i32(0, 4).unwrap(), vec![0; 4]);
        }
    })
    .await;
}

#[tokio::test]
async fn test_out_of_bounds_put_rejected() {
    run_ranks(2, |boot| async move {
        let comm = Communicator::new(boot);
        let peer = 1 - comm.rank();
        let buf = HostPlatform::new(1).alloc(0, 32).unwrap();
        let mem = comm
            .register_memory(&buf, Transport::LocalFastPath.into())
            .unwrap();
        let conn = comm.connect(peer, 0, Transport::LocalFastPath).unwrap();
        let handle = comm.exchange_memory(peer, 0, &mem).unwrap();
        comm.finalize_setup().await.unwrap();

        let err = conn
            .put(handle.get().unwrap(), 24, &buf, 0, 16)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::OutOfBounds { .. }), "got {err}");
    })
    .await;
}

#[tokio::test]
async fn test_channel_rejects_unregistered_transport() {
    run_ranks(2, |boot| async move {
        let comm = Communicator::new(boot);
        let peer = 1 - comm.rank();
        let buf = HostPlatform::new(1).alloc(0, 64).unwrap();
        // Registered for the fabric only, while the connection is local.
        let mem = comm
            .register_memory(&buf, Transport::RemoteFabric(0).into())
            .unwrap();
        let conn = comm.connect(peer, 0, Transport::LocalFastPath).unwrap();
        let handle = comm.exchange_memory(peer, 0, &mem).unwrap();
        comm.finalize_setup().await.unwrap();

        let result = DirectChannel::new(
            DirectEpoch::new(conn, Duration::from_secs(1)),
            handle.get().unwrap().clone(),
            buf,
            None,
        );
        assert!(matches!(
            result,
            Err(BenchError::TransportNotRegistered { .. })
        ));
    })
    .await;
}

#[tokio::test]
async fn test_transport_class_mismatch_fails_setup() {
    let results = run_ranks(2, |boot| async move {
        let comm = Communicator::new(boot);
        let peer = 1 - comm.rank();
        let transport = if comm.rank() == 0 {
            Transport::LocalFastPath
        } else {
            Transport::RemoteFabric(0)
        };
        comm.connect(peer, 0, transport).unwrap();
        comm.finalize_setup().await
    })
    .await;
    for r in results {
        assert!(matches!(r, Err(BenchError::TransportMismatch { .. })), "got {r:?}");
    }
}

#[tokio::test]
async fn test_put_into_released_memory_faults_peer_wait() {
    run_ranks(2, |boot| async move {
        let comm = Communicator::new(Arc::clone(&boot));
        let rank = comm.rank();
        let peer = 1 - rank;
        let buf = HostPlatform::new(1).alloc(0, 64).unwrap();
        let mem = comm
            .register_memory(&buf, Transport::LocalFastPath.into())
            .unwrap();
        let conn = comm.connect(peer, 3, Transport::LocalFastPath).unwrap();
        let handle = comm.exchange_memory(peer, 3, &mem).unwrap();
        comm.finalize_setup().await.unwrap();

        if rank == 1 {
            drop(mem);
        }
        boot.barrier().await.unwrap();

        if rank == 0 {
            buf.write_i32(0, &[5; 4]).unwrap();
            conn.put(handle.get().unwrap(), 0, &buf, 0, 16).await.unwrap();
            conn.signal().await.unwrap();
        } else {
            let err = tokio::time::timeout(Duration::from_secs(10), conn.inbound().wait_for(1))
                .await
                .unwrap()
                .unwrap_err();
            assert!(matches!(err, BenchError::ChannelFault(_)), "got {err}");
            assert_eq!(buf.read_i32(0, 4).unwrap(), vec![0; 4]);
        }
        boot.barrier().await.unwrap();
    })
    .await;
}
