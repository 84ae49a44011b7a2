use collbench::channel::setup_mesh;
use collbench::comm::Communicator;
use collbench::device::{HostPlatform, Platform};
use collbench::{RankTopology, Transport};

use super::helpers::run_ranks_on_hosts;

#[tokio::test]
async fn test_layout_from_hostnames() {
    let layouts = run_ranks_on_hosts(&["a", "a", "b", "b"], |boot| async move {
        (boot.ranks_per_node(), boot.local_rank(), boot.num_nodes())
    })
    .await;
    assert_eq!(layouts, vec![(2, 0, 2), (2, 1, 2), (2, 0, 2), (2, 1, 2)]);
}

#[tokio::test]
async fn test_mesh_transports_follow_nodes() {
    run_ranks_on_hosts(&["a", "a", "b", "b"], |boot| async move {
        let rank = boot.rank();
        let device = boot.local_rank() as usize;
        let topology = RankTopology::new(rank, 4, boot.ranks_per_node(), device).unwrap();
        let comm = Communicator::new(boot);
        let buf = HostPlatform::new(2).alloc(device, 256).unwrap();

        let mesh = setup_mesh(&comm, &topology, &buf, None).await.unwrap();
        assert_eq!(mesh.connections.len(), 3);
        for conn in &mesh.connections {
            let peer = conn.peer();
            let peer_device = peer % 2;
            if peer / 2 == rank / 2 {
                assert_eq!(conn.transport(), Transport::LocalFastPath);
                assert_eq!(conn.remote_transport().unwrap(), Transport::LocalFastPath);
            } else {
                assert_eq!(conn.transport(), Transport::RemoteFabric(device as u8));
                assert_eq!(
                    conn.remote_transport().unwrap(),
                    Transport::RemoteFabric(peer_device as u8)
                );
            }
        }
        for handle in &mesh.remote_memories {
            let remote = handle.get().unwrap();
            assert_eq!(remote.owner, handle.peer());
            assert!(remote.transports.contains(Transport::LocalFastPath));
        }
    })
    .await;
}
