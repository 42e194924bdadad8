//! Fuzz target for controller requests.
//!
//! Builds structured inbound envelopes and checks they survive the wire intact.

#![no_main]

use arbitrary::Arbitrary;
use hive_agent::protocol::{self, Envelope};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum FuzzInbound {
    Exec {
        request_id: String,
        command: String,
        timeout_seconds: Option<u32>,
    },
    PtyStart {
        session_id: String,
        request_id: Option<String>,
        shell: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    },
    PtyInput {
        session_id: String,
        data: Vec<u8>,
    },
    PtyResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    PtyEnd {
        session_id: String,
    },
}

fuzz_target!(|inbound: FuzzInbound| {
    let envelope = match inbound {
        FuzzInbound::Exec {
            request_id,
            command,
            timeout_seconds,
        } => Envelope::Exec {
            request_id,
            command,
            timeout_seconds: timeout_seconds.map(f64::from),
        },
        FuzzInbound::PtyStart {
            session_id,
            request_id,
            shell,
            cols,
            rows,
        } => Envelope::PtyStart {
            session_id,
            request_id,
            shell,
            cols,
            rows,
        },
        FuzzInbound::PtyInput { session_id, data } => Envelope::PtyInput { session_id, data },
        FuzzInbound::PtyResize {
            session_id,
            cols,
            rows,
        } => Envelope::PtyResize {
            session_id,
            cols,
            rows,
        },
        FuzzInbound::PtyEnd { session_id } => Envelope::PtyEnd { session_id },
    };

    let text = envelope.encode().expect("encode failed");
    let decoded = protocol::decode(&text).expect("decode failed");
    assert_eq!(decoded, envelope);
});
