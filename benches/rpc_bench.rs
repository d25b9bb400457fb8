//! Ping-pong benchmark over the loopback fabric.
//!
//! Measures request/response latency and throughput for small and
//! packet-spanning messages, with both endpoints polled from the bench
//! thread.
//!
//! Run with:
//! ```bash
//! cargo bench --bench rpc_bench
//! ```

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use udrpc::{Fabric, FabricTransport, Nexus, RespHandle, Rpc, RpcConfig, SmEventType};

const SMALL_MSG_SIZE: usize = 32;
const LARGE_MSG_SIZE: usize = 4096;

const ECHO_REQ_TYPE: u8 = 1;

struct Loopback {
    _fabric: Fabric,
    server: Rpc<FabricTransport>,
    client: Rpc<FabricTransport>,
    session: u16,
}

fn setup() -> Loopback {
    let nexus = Nexus::new("proc://bench");
    let fabric = Fabric::new();

    let server = Rpc::new(
        &nexus,
        1,
        0,
        fabric.new_transport(),
        |_| {},
        RpcConfig::default(),
    )
    .expect("server construction failed");
    server.register_req_handler(ECHO_REQ_TYPE, |req| {
        let data = req.copy_req_data();
        let mut resp = req.alloc_msg_buffer(data.len());
        resp.copy_in_data(&data).unwrap();
        req.enqueue_response(resp).unwrap();
    });

    let connected = Rc::new(Cell::new(false));
    let cf = connected.clone();
    let client = Rpc::new(
        &nexus,
        2,
        0,
        fabric.new_transport(),
        move |ev| {
            if ev.event_type == SmEventType::Connected {
                cf.set(true);
            }
        },
        RpcConfig::default(),
    )
    .expect("client construction failed");

    let session = client
        .create_session("proc://bench", 1, 0)
        .expect("create_session failed");
    while !connected.get() {
        client.run_event_loop_one();
        server.run_event_loop_one();
    }

    Loopback {
        _fabric: fabric,
        server,
        client,
        session,
    }
}

fn bench_echo(c: &mut Criterion) {
    let lb = setup();
    let mut group = c.benchmark_group("echo");

    for size in [SMALL_MSG_SIZE, LARGE_MSG_SIZE] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = vec![0xAB_u8; size];
            let mut req = lb.client.alloc_msg_buffer(size);
            req.copy_in_data(&payload).unwrap();

            let done: Rc<RefCell<Option<RespHandle>>> = Rc::new(RefCell::new(None));
            b.iter(|| {
                let d = done.clone();
                lb.client
                    .enqueue_request(
                        lb.session,
                        ECHO_REQ_TYPE,
                        &req,
                        move |resp, _tag| {
                            *d.borrow_mut() = Some(resp);
                        },
                        0,
                    )
                    .unwrap();
                while done.borrow().is_none() {
                    lb.client.run_event_loop_one();
                    lb.server.run_event_loop_one();
                }
                let resp = done.borrow_mut().take().unwrap();
                lb.client.release_response(resp).unwrap();
            });

            lb.client.free_msg_buffer(req).unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_echo);
criterion_main!(benches);
