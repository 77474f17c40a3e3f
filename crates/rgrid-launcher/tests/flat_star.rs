//! End-to-end launcher protocol: engine thread + worker threads over
//! loopback, both for the flat star alone and for the launcher-mediated
//! tree wireup.

use std::net::{Ipv4Addr, TcpListener};
use std::thread;

use rgrid_fabric::config::Identity;
use rgrid_fabric::launcher::LauncherConn;
use rgrid_fabric::tree::{ReduceOp, Tree};
use rgrid_fabric::{Fabric, FabricConfig};
use rgrid_launcher::{accept_workers, process_ops};

fn spawn_launcher(nprocs: usize) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut conns = accept_workers(&listener, nprocs).expect("accept workers");
        process_ops(&mut conns).expect("engine");
    });
    (port, handle)
}

fn worker_config(rank: usize, nprocs: usize, port: u16) -> FabricConfig {
    FabricConfig {
        launcher_host: Some("127.0.0.1".to_string()),
        launcher_port: port,
        identity: Some(Identity {
            rank,
            nprocs,
            jobid: 11,
        }),
        connect_backoff_s: 0,
        ..Default::default()
    }
}

#[test]
fn test_flat_star_collectives() {
    let n = 4;
    let (port, engine) = spawn_launcher(n);
    let mut handles = Vec::new();
    for rank in 0..n {
        handles.push(thread::spawn(move || {
            let cfg = worker_config(rank, n, port);
            let mut conn = LauncherConn::open(&cfg).expect("open");

            conn.barrier().unwrap();

            // bcast from a non-zero root
            let mut buf = if rank == 2 { vec![9u8; 3] } else { vec![0u8; 3] };
            conn.bcast(&mut buf, 2).unwrap();
            assert_eq!(buf, vec![9u8; 3]);

            // gather to root 1
            let send = [rank as u8; 2];
            let mut recv = vec![0u8; 2 * n];
            conn.gather(&send, &mut recv, 1).unwrap();
            if rank == 1 {
                for r in 0..n {
                    assert_eq!(&recv[2 * r..2 * r + 2], &[r as u8; 2]);
                }
            }

            // scatter from root 0
            let send: Vec<u8> = if rank == 0 {
                (0..n as u8).collect()
            } else {
                Vec::new()
            };
            let mut one = [0u8; 1];
            conn.scatter(&send, 1, &mut one, 0).unwrap();
            assert_eq!(one[0], rank as u8);

            // allgather
            let mut all = vec![0u8; n];
            conn.allgather(&[rank as u8], &mut all).unwrap();
            assert_eq!(all, (0..n as u8).collect::<Vec<_>>());

            // alltoall with transposition
            let send: Vec<u8> = (0..n).map(|d| (10 * rank + d) as u8).collect();
            let mut recv = vec![0u8; n];
            conn.alltoall(&send, 1, &mut recv).unwrap();
            let expect: Vec<u8> = (0..n).map(|s| (10 * s + rank) as u8).collect();
            assert_eq!(recv, expect);

            conn.close().unwrap();
        }));
    }
    for h in handles {
        h.join().expect("worker panicked");
    }
    engine.join().expect("engine panicked");
}

#[test]
fn test_tree_wireup_via_launcher() {
    let n = 6;
    let (port, engine) = spawn_launcher(n);
    let mut handles = Vec::new();
    for rank in 0..n {
        handles.push(thread::spawn(move || {
            let cfg = worker_config(rank, n, port);
            let mut conn = LauncherConn::open(&cfg).expect("open");
            let auth = rgrid_fabric::auth::AuthParams::symmetric(
                &cfg.auth_text(),
                cfg.auth_enable,
                cfg.auth_timeout_ms,
            );
            let mut tree = Tree::open_via_launcher(&cfg, &mut conn, &auth).expect("tree wireup");
            let sum = tree
                .allreduce_i64(tree.rank() as i64 + 1, ReduceOp::Sum)
                .unwrap();
            assert_eq!(sum, 21);
            tree.close();
            conn.close().unwrap();
        }));
    }
    for h in handles {
        h.join().expect("worker panicked");
    }
    engine.join().expect("engine panicked");
}

#[test]
fn test_fabric_front_door() {
    let n = 5;
    let (port, engine) = spawn_launcher(n);
    let mut handles = Vec::new();
    for rank in 0..n {
        handles.push(thread::spawn(move || {
            let cfg = worker_config(rank, n, port);
            let mut fabric = Fabric::init(cfg).expect("init");
            fabric.open(None).expect("open");

            fabric.barrier().unwrap();
            let total = fabric.allreduce_i64(2, ReduceOp::Sum).unwrap();
            assert_eq!(total, 10);

            let names = fabric.allgather_str(&format!("proc-{rank}")).unwrap();
            assert_eq!(names.len(), n);
            for (r, name) in names.iter().enumerate() {
                assert_eq!(name, &format!("proc-{r}"));
            }

            let agg = fabric.aggregate(&vec![rank as u8; rank]).unwrap();
            assert_eq!(agg.len(), (0..n).sum::<usize>());

            fabric.close().unwrap();
        }));
    }
    for h in handles {
        h.join().expect("worker panicked");
    }
    engine.join().expect("engine panicked");
}
