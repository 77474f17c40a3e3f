//! End-to-end scheduler loop scenarios over the event channel.

use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::{Value, json};

use rgrid_sched::{
    Event, HelloJob, Request, ResourceUpdate, SchedConfig, SchedError, SchedResponse, SimpleSched,
};

fn r_json(nnodes: usize, cores: &str) -> Value {
    json!({
        "version": 1,
        "execution": {
            "R_lite": [{"rank": format!("0-{}", nnodes - 1), "children": {"core": cores}}],
            "nodelist": [format!("n[0-{}]", nnodes - 1)],
        }
    })
}

struct Harness {
    events: Sender<Event>,
    handle: std::thread::JoinHandle<Result<(), SchedError>>,
}

impl Harness {
    fn start(cfg: SchedConfig, initial: Value, hello: Vec<HelloJob>) -> Harness {
        let (tx, rx) = unbounded();
        let handle = std::thread::spawn(move || {
            let first = ResourceUpdate {
                up: Some("all".to_string()),
                ..Default::default()
            };
            let mut sched = SimpleSched::new(cfg, rx, &initial, &first, &hello)?;
            sched.run()
        });
        Harness { events: tx, handle }
    }

    fn alloc(&self, id: u64, priority: u32, jobspec: Value) -> Receiver<SchedResponse> {
        let (reply, rx) = unbounded();
        self.events
            .send(Event::Request(Request::Alloc {
                id,
                priority,
                userid: 1000,
                t_submit: id as f64,
                jobspec,
                reply,
            }))
            .unwrap();
        rx
    }

    fn free(&self, id: u64, r: &str) {
        self.events
            .send(Event::Request(Request::Free {
                id,
                r: serde_json::from_str(r).unwrap(),
                is_final: true,
            }))
            .unwrap();
    }

    fn stop(self) -> Result<(), SchedError> {
        // the loop may already have exited (fatal-path tests)
        let _ = self.events.send(Event::Request(Request::Stop));
        self.handle.join().unwrap()
    }
}

fn expect_success(rx: &Receiver<SchedResponse>) -> String {
    match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
        SchedResponse::Success { r, .. } => r,
        other => panic!("expected success, got {other:?}"),
    }
}

fn expect_deny(rx: &Receiver<SchedResponse>) -> String {
    match rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
        SchedResponse::Deny { note, .. } => note,
        other => panic!("expected deny, got {other:?}"),
    }
}

#[test]
fn test_alloc_free_cycle() {
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let rx = h.alloc(1, 16, json!({"nslots": 2, "slot_size": 2}));
    let r = expect_success(&rx);
    assert!(r.contains("\"version\":1"));
    h.free(1, &r);
    // after the free the same request succeeds again
    let rx = h.alloc(2, 16, json!({"nslots": 4, "slot_size": 2}));
    expect_success(&rx);
    h.stop().unwrap();
}

#[test]
fn test_seed_scenario_feasibility() {
    // total 8 cores, all currently allocated
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let rx_hold = h.alloc(1, 16, json!({"nslots": 8, "slot_size": 1}));
    let held_r = expect_success(&rx_hold);

    // 16 cores can never fit: deny with "unsatisfiable request"
    let rx = h.alloc(2, 16, json!({"nslots": 16, "slot_size": 1}));
    assert_eq!(expect_deny(&rx), "unsatisfiable request");

    // 4 cores fit in principle but not now: stays pending
    let rx_pending = h.alloc(3, 16, json!({"nslots": 4, "slot_size": 1}));
    assert!(
        rx_pending
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err(),
        "request should stay queued while resources are exhausted"
    );

    // freeing the held allocation lets the pending request through
    h.free(1, &held_r);
    expect_success(&rx_pending);
    h.stop().unwrap();
}

#[test]
fn test_deny_gpu_and_bad_spec() {
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let rx = h.alloc(1, 16, json!({"nslots": 1, "gpus_per_slot": 1}));
    assert!(expect_deny(&rx).contains("does not support resource type 'gpu'"));
    let rx = h.alloc(2, 16, json!({"nslots": 0}));
    assert!(expect_deny(&rx).contains("at least one slot"));
    h.stop().unwrap();
}

#[test]
fn test_concurrency_limit() {
    let mut cfg = SchedConfig::default();
    cfg.set_mode("limited=1").unwrap();
    let h = Harness::start(cfg, r_json(1, "0-1"), Vec::new());
    // fill the node, then queue one pending request to hit the limit
    let rx1 = h.alloc(1, 16, json!({"nslots": 2, "slot_size": 1}));
    expect_success(&rx1);
    let _rx2 = h.alloc(2, 16, json!({"nslots": 2, "slot_size": 1}));
    let rx3 = h.alloc(3, 16, json!({"nslots": 1, "slot_size": 1}));
    match rx3.recv_timeout(std::time::Duration::from_secs(5)).unwrap() {
        SchedResponse::Error { message } => assert!(message.contains("max concurrency")),
        other => panic!("expected error, got {other:?}"),
    }
    h.stop().unwrap();
}

#[test]
fn test_priority_order_and_cancel() {
    let h = Harness::start(SchedConfig::default(), r_json(1, "0-1"), Vec::new());
    // exhaust resources so later requests queue up
    let rx_hold = h.alloc(1, 16, json!({"nslots": 2, "slot_size": 1}));
    let held = expect_success(&rx_hold);

    let rx_low = h.alloc(2, 10, json!({"nslots": 2, "slot_size": 1}));
    let rx_high = h.alloc(3, 20, json!({"nslots": 2, "slot_size": 1}));

    // cancel the low-priority request
    let (reply, rx_cancel) = unbounded();
    h.events
        .send(Event::Request(Request::Cancel { id: 2, reply }))
        .unwrap();
    assert_eq!(
        rx_cancel
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap(),
        SchedResponse::Cancel { id: 2 }
    );

    h.free(1, &held);
    expect_success(&rx_high);
    assert!(
        rx_low
            .recv_timeout(std::time::Duration::from_millis(100))
            .is_err(),
        "cancelled request must not receive a further response"
    );
    h.stop().unwrap();
}

#[test]
fn test_prioritize_reorders_pending() {
    let h = Harness::start(SchedConfig::default(), r_json(1, "0-1"), Vec::new());
    let rx_hold = h.alloc(1, 16, json!({"nslots": 2, "slot_size": 1}));
    let held = expect_success(&rx_hold);

    let rx_a = h.alloc(2, 10, json!({"nslots": 2, "slot_size": 1}));
    let rx_b = h.alloc(3, 10, json!({"nslots": 2, "slot_size": 1}));

    // push job 3 ahead of job 2
    h.events
        .send(Event::Request(Request::Prioritize {
            updates: vec![(3, 30)],
        }))
        .unwrap();

    h.free(1, &held);
    let r_b = expect_success(&rx_b);
    h.free(3, &r_b);
    expect_success(&rx_a);
    h.stop().unwrap();
}

#[test]
fn test_feasibility_check() {
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let ask = |jobspec: Value| {
        let (reply, rx) = unbounded();
        h.events
            .send(Event::Request(Request::Feasibility { jobspec, reply }))
            .unwrap();
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap()
    };
    assert_eq!(ask(json!({"nslots": 8, "slot_size": 1})), SchedResponse::Ok);
    match ask(json!({"nslots": 9, "slot_size": 1})) {
        SchedResponse::Error { message } => assert!(message.contains("unsatisfiable")),
        other => panic!("expected error, got {other:?}"),
    }
    // the dry run must not consume resources
    let rx = h.alloc(1, 16, json!({"nslots": 8, "slot_size": 1}));
    expect_success(&rx);
    h.stop().unwrap();
}

#[test]
fn test_resource_status_and_updates() {
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let rx1 = h.alloc(1, 16, json!({"nslots": 1, "slot_size": 1}));
    expect_success(&rx1);

    h.events
        .send(Event::Resource(ResourceUpdate {
            down: Some("1".to_string()),
            ..Default::default()
        }))
        .unwrap();

    let (reply, rx) = unbounded();
    h.events
        .send(Event::Request(Request::ResourceStatus { reply }))
        .unwrap();
    let status = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    let all = rgrid_rset::Rlist::from_json(&status.all).unwrap();
    assert_eq!(all.total(), 8);
    let allocated = rgrid_rset::Rlist::from_json(&status.allocated).unwrap();
    assert_eq!(allocated.total(), 1);
    let down = rgrid_rset::Rlist::from_json(&status.down).unwrap();
    assert_eq!(down.nnodes(), 1);
    h.stop().unwrap();
}

#[test]
fn test_shrink_tolerant_free() {
    let h = Harness::start(SchedConfig::default(), r_json(2, "0-3"), Vec::new());
    let rx = h.alloc(1, 16, json!({"nnodes": 2, "nslots": 2, "slot_size": 4}));
    let r = expect_success(&rx);

    // rank 1 shrinks away while job 1 still holds cores there
    h.events
        .send(Event::Resource(ResourceUpdate {
            shrink: Some("1".to_string()),
            ..Default::default()
        }))
        .unwrap();
    // the free of the full allocation is tolerated
    h.free(1, &r);
    let rx = h.alloc(2, 16, json!({"nslots": 4, "slot_size": 1}));
    expect_success(&rx);
    h.stop().unwrap();
}

#[test]
fn test_hello_replays_allocations() {
    let initial = r_json(2, "0-3");
    // job 7 already holds all of rank 0
    let held = json!({
        "version": 1,
        "execution": {
            "R_lite": [{"rank": "0", "children": {"core": "0-3"}}],
            "nodelist": ["n0"],
        }
    });
    let hello = vec![HelloJob {
        id: 7,
        priority: 16,
        userid: 1000,
        t_submit: 1.0,
        r: held.to_string(),
    }];
    let h = Harness::start(SchedConfig::default(), initial, hello);
    // only rank 1's cores remain
    let rx = h.alloc(1, 16, json!({"nslots": 5, "slot_size": 1}));
    assert!(
        rx.recv_timeout(std::time::Duration::from_millis(200)).is_err(),
        "5 cores cannot fit while the hello allocation holds rank 0"
    );
    h.stop().unwrap();
}

#[test]
fn test_corrupt_free_is_fatal() {
    let h = Harness::start(SchedConfig::default(), r_json(1, "0-3"), Vec::new());
    // free resources that were never allocated
    h.free(9, &r_json(1, "0-3").to_string());
    match h.stop() {
        Err(SchedError::Fatal(_)) => {}
        other => panic!("expected fatal stop, got {other:?}"),
    }
}
