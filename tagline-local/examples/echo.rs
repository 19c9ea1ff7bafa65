//! Echo server and client over the in-process engine.
//!
//! Usage:
//!   cargo run -p tagline-local --example echo [MESSAGE...]
//!   # default message: "hello world"
//!
//! The server thread answers `/echo.Echo/DoEcho` with the request body; the
//! client sends each message and prints the reply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tagline::{
    ByteBuffer, CallType, Client, ClientConfigBuilder, ConnectivityState, Error, MetadataMap,
    Server, ServerConfigBuilder, ServerResponse,
};
use tagline_local::LocalEngine;

const METHOD: &str = "/echo.Echo/DoEcho";

fn main() {
    let mut messages: Vec<String> = std::env::args().skip(1).collect();
    if messages.is_empty() {
        messages.push("hello world".to_string());
    }

    let engine = LocalEngine::init().expect("failed to start engine");
    let server_config = ServerConfigBuilder::new()
        .bind("localhost", 50051)
        .register_method(METHOD, CallType::Normal)
        .build()
        .expect("invalid server config");
    let server = Server::new(&engine, server_config).expect("failed to start server");
    let method = server
        .registered_method(METHOD)
        .expect("method registered")
        .clone();

    let client_config = ClientConfigBuilder::new()
        .target("localhost", 50051)
        .build()
        .expect("invalid client config");
    let client = Client::new(&engine, client_config).expect("failed to create client");
    let echo = client
        .register_method(METHOD, CallType::Normal)
        .expect("failed to register method");

    let state = client.connectivity_state(true);
    eprintln!("channel to localhost:50051 is {state}");
    assert_eq!(state, ConnectivityState::Ready);

    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                let served = server.handle_registered(
                    &method,
                    Some(Duration::from_millis(100)),
                    |call, request| {
                        let body = request.body.unwrap_or_default();
                        eprintln!("[server] {} <- {} bytes", call.method(), body.len());
                        ServerResponse::ok(body)
                    },
                );
                match served {
                    Ok(()) | Err(Error::TimedOut) => {}
                    Err(e) => {
                        eprintln!("[server] error: {e}");
                        break;
                    }
                }
            }
        });

        for message in &messages {
            let result = client.registered_request(
                &echo,
                Duration::from_secs(5),
                ByteBuffer::copy_in(message.as_bytes()),
                MetadataMap::new(),
            );
            match result {
                Ok(reply) => {
                    let body = reply.body.map(|b| b.copy_out()).unwrap_or_default();
                    println!("{}", String::from_utf8_lossy(&body));
                }
                Err(e) => eprintln!("[client] request failed: {e}"),
            }
        }
        stop.store(true, Ordering::Release);
    });
}
