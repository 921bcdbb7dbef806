#![no_main]

use bytes::BytesMut;
use gearman_core::alloc::WorkloadAllocator;
use gearman_core::packet::{decode, HEADER_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let alloc = WorkloadAllocator::new();

    // Whole input at once
    let mut buf = BytesMut::from(data);
    while let Ok(Some(packet)) = decode(&mut buf, &alloc) {
        // Anything accepted re-encodes to its advertised size
        if let Ok(wire) = packet.encode() {
            assert_eq!(wire.len(), packet.wire_len());
            assert!(wire.len() >= HEADER_SIZE);
        }
    }

    // Same input fed in small chunks must never panic or lose data
    let mut buf = BytesMut::new();
    for chunk in data.chunks(7) {
        buf.extend_from_slice(chunk);
        loop {
            match decode(&mut buf, &alloc) {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
    }
});
