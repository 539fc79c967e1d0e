extern crate bep_utp;
extern crate bytes;
extern crate futures;
extern crate tokio_core;

use std::time::Duration;

use bep_utp::{IUtpMessage, OUtpMessage, UtpSocketManager};
use bytes::Bytes;
use futures::future::Future;
use futures::sink::Sink;
use futures::stream::Stream;
use tokio_core::reactor::{Core, Timeout};

/// Pull the next event off the manager stream, panicking on timeout.
fn next_event(core: &mut Core, manager: UtpSocketManager, timeout_ms: u64) -> (OUtpMessage, UtpSocketManager) {
    let timeout = Timeout::new(Duration::from_millis(timeout_ms), &core.handle())
        .unwrap()
        .then(|_| Err(()));

    let (opt_msg, manager) = core
        .run(
            manager
                .into_future()
                .map_err(|_| ())
                .select(timeout)
                .map(|(item, _)| item)
                .map_err(|_| ()),
        )
        .unwrap_or_else(|_| panic!("Timed Out Waiting For A Utp Event"));

    (opt_msg.unwrap_or_else(|| panic!("Utp Event Stream Ended")), manager)
}

/// Send a command through the manager sink.
fn send_command(core: &mut Core, manager: UtpSocketManager, msg: IUtpMessage) -> UtpSocketManager {
    core.run(manager.send(msg))
        .unwrap_or_else(|_| panic!("Failed To Send Utp Command"))
}

#[test]
fn positive_connect_exchange_close() {
    let mut core = Core::new().unwrap();
    let handle = core.handle();

    let alpha = UtpSocketManager::new("127.0.0.1:0".parse().unwrap(), &handle).unwrap();
    let beta = UtpSocketManager::new("127.0.0.1:0".parse().unwrap(), &handle).unwrap();
    let beta_addr = beta.local_addr();

    // Alpha dials beta and both sides observe the handshake.
    let alpha = send_command(&mut core, alpha, IUtpMessage::Connect(beta_addr));

    let (event, beta) = next_event(&mut core, beta, 5000);
    let beta_token = match event {
        OUtpMessage::Incoming(token, _) => token,
        unexpected => panic!("Unexpected Beta Event: {:?}", unexpected),
    };

    let (event, alpha) = next_event(&mut core, alpha, 5000);
    let alpha_token = match event {
        OUtpMessage::Connected(token, addr) => {
            assert_eq!(beta_addr, addr);
            token
        }
        unexpected => panic!("Unexpected Alpha Event: {:?}", unexpected),
    };

    // Bytes flow alpha to beta.
    let request = b"interested in piece 42".to_vec();
    let alpha = send_command(&mut core, alpha, IUtpMessage::Send(alpha_token, Bytes::from(request.clone())));

    let (event, beta) = next_event(&mut core, beta, 5000);
    match event {
        OUtpMessage::Data(token, payload) => {
            assert_eq!(beta_token, token);
            assert_eq!(request, Vec::from(&payload[..]));
        }
        unexpected => panic!("Unexpected Beta Event: {:?}", unexpected),
    }

    // And back again.
    let reply = b"here is piece 42".to_vec();
    let beta = send_command(&mut core, beta, IUtpMessage::Send(beta_token, Bytes::from(reply.clone())));

    let (event, alpha) = next_event(&mut core, alpha, 5000);
    match event {
        OUtpMessage::Data(token, payload) => {
            assert_eq!(alpha_token, token);
            assert_eq!(reply, Vec::from(&payload[..]));
        }
        unexpected => panic!("Unexpected Alpha Event: {:?}", unexpected),
    }

    // Alpha closes, beta sees the end of stream.
    let _alpha = send_command(&mut core, alpha, IUtpMessage::Close(alpha_token));

    let (event, _beta) = next_event(&mut core, beta, 5000);
    match event {
        OUtpMessage::Eof(token) => assert_eq!(beta_token, token),
        unexpected => panic!("Unexpected Beta Event: {:?}", unexpected),
    }
}

#[test]
fn positive_large_transfer_in_order() {
    let mut core = Core::new().unwrap();
    let handle = core.handle();

    let alpha = UtpSocketManager::new("127.0.0.1:0".parse().unwrap(), &handle).unwrap();
    let beta = UtpSocketManager::new("127.0.0.1:0".parse().unwrap(), &handle).unwrap();
    let beta_addr = beta.local_addr();

    let alpha = send_command(&mut core, alpha, IUtpMessage::Connect(beta_addr));

    let (event, mut beta) = next_event(&mut core, beta, 5000);
    let beta_token = match event {
        OUtpMessage::Incoming(token, _) => token,
        unexpected => panic!("Unexpected Beta Event: {:?}", unexpected),
    };

    let (event, alpha) = next_event(&mut core, alpha, 5000);
    let alpha_token = match event {
        OUtpMessage::Connected(token, _) => token,
        unexpected => panic!("Unexpected Alpha Event: {:?}", unexpected),
    };

    // Several segments worth of patterned data, delivered in order.
    let payload: Vec<u8> = (0..20_000u32).map(|index| index as u8).collect();
    let _alpha = send_command(&mut core, alpha, IUtpMessage::Send(alpha_token, Bytes::from(payload.clone())));

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let (event, next_beta) = next_event(&mut core, beta, 5000);
        beta = next_beta;

        match event {
            OUtpMessage::Data(token, data) => {
                assert_eq!(beta_token, token);
                received.extend_from_slice(&data);
            }
            unexpected => panic!("Unexpected Beta Event: {:?}", unexpected),
        }
    }

    assert_eq!(payload, received);
}
