//! Performance benchmarks for the hot paths of the update protocol

use protocol::chunk::{ChunkDatagram, ChunkReceiver, ChunkSender};
use protocol::flags::FlagWidth;
use protocol::items::{ChatMessage, EntityUpdate, PlayerUpdate};
use protocol::{
    AddonRegistry, ClientBoundField, NetConfig, PacketReader, PacketWriter, ServerBoundField,
    UpdateManager, UpdatePacket, Value, Vector2,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn report(name: &str, iterations: u32, duration: Duration) {
    println!(
        "{}: {} iterations in {:?} ({:.2} ns/iter)",
        name,
        iterations,
        duration,
        duration.as_nanos() as f64 / f64::from(iterations)
    );
}

fn busy_packet() -> UpdatePacket<ClientBoundField> {
    let mut packet = UpdatePacket::new();
    for id in 0..32u16 {
        packet.push_entry(
            ClientBoundField::PlayerUpdate,
            PlayerUpdate {
                id,
                position: Some(Vector2 {
                    x: f32::from(id) * 1.5,
                    y: 12.0,
                }),
                scale: Some(id % 2 == 0),
                animation: None,
            },
        );
        packet.push_entry(
            ClientBoundField::EntityUpdate,
            EntityUpdate {
                entity_id: id,
                position: None,
                variables: vec![(0, Value::Float(0.5)), (3, Value::Bool(true))],
            },
        );
    }
    packet.push_entry(ClientBoundField::ChatMessage, ChatMessage::new("Hornet: shaw"));
    packet
}

/// Benchmarks primitive writes and reads
#[test]
fn benchmark_primitive_codec() {
    let iterations = 100_000;
    let start = Instant::now();

    for i in 0..iterations {
        let mut writer = PacketWriter::with_capacity(32);
        writer.write_u16(i as u16);
        writer.write_f32(i as f32);
        writer.write_string("Crossroads").unwrap();
        writer.write_vector2(Vector2 { x: 1.0, y: 2.0 });

        let bytes = writer.into_bytes();
        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), i as u16);
        let _ = reader.read_f32().unwrap();
        let _ = reader.read_string().unwrap();
        let _ = reader.read_vector2().unwrap();
    }

    let duration = start.elapsed();
    report("Primitive codec", iterations, duration);

    // Should complete in under 2s for 100k iterations, even unoptimised
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks encoding a packet carrying a full scene of updates
#[test]
fn benchmark_packet_encoding() {
    let iterations = 2_000;
    let start = Instant::now();
    let mut size = 0;

    for _ in 0..iterations {
        let mut packet = busy_packet();
        size = packet.encode(FlagWidth::U32).unwrap().len();
    }

    let duration = start.elapsed();
    report("Packet encoding", iterations, duration);
    println!("Encoded packet size: {} bytes", size);

    assert!(size < 1200, "a busy packet should fit one datagram");
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks decoding the same packet
#[test]
fn benchmark_packet_decoding() {
    let registry = AddonRegistry::new();
    let bytes = busy_packet().encode(FlagWidth::U32).unwrap();

    let iterations = 2_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet =
            UpdatePacket::<ClientBoundField>::decode(&bytes, FlagWidth::U32, &registry).unwrap();
        assert!(packet.contains(ClientBoundField::PlayerUpdate));
    }

    let duration = start.elapsed();
    report("Packet decoding", iterations, duration);

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks a full flush/receive round trip between two update managers
#[test]
fn benchmark_update_manager_round_trip() {
    let config = NetConfig::default();
    let registry = Arc::new(AddonRegistry::new());
    let client =
        UpdateManager::<ServerBoundField, ClientBoundField>::new(&config, Arc::clone(&registry))
            .unwrap();
    let server = UpdateManager::<ClientBoundField, ServerBoundField>::new(&config, registry).unwrap();

    let iterations = 10_000;
    let start = Instant::now();

    for i in 0..iterations {
        client.update(|packet| {
            packet.push_entry(
                ServerBoundField::PlayerUpdate,
                PlayerUpdate {
                    id: 1,
                    position: Some(Vector2 {
                        x: i as f32,
                        y: 0.0,
                    }),
                    ..Default::default()
                },
            )
        });
        let upstream = client.flush().unwrap();
        server.receive(&upstream).unwrap();
        let downstream = server.flush().unwrap();
        client.receive(&downstream).unwrap();
    }

    let duration = start.elapsed();
    report("Update round trip", iterations, duration);

    // Everything is acked, so nothing piles up
    assert!(client.in_flight() < 40);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks slicing and reassembling a large handshake payload
#[test]
fn benchmark_chunk_reassembly() {
    let slice_size = 1024;
    let payload: Vec<u8> = (0..200 * 1024u32).map(|i| (i % 253) as u8).collect();

    let iterations = 20;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut sender = ChunkSender::new(slice_size, Duration::from_millis(100));
        let mut receiver = ChunkReceiver::new(slice_size);
        sender.enqueue(payload.clone()).unwrap();

        let mut delivered = None;
        for datagram in sender.poll(Instant::now()) {
            let bytes = datagram.encode();
            if let ChunkDatagram::Slice(slice) = ChunkDatagram::decode(&bytes, slice_size).unwrap() {
                let outcome = receiver.handle_slice(slice).unwrap();
                sender.handle_ack(&outcome.ack);
                if outcome.completed.is_some() {
                    delivered = outcome.completed;
                }
            }
        }

        assert_eq!(delivered.as_deref(), Some(payload.as_slice()));
        assert!(sender.is_idle());
    }

    let duration = start.elapsed();
    report("Chunk reassembly", iterations, duration);

    assert!(duration.as_millis() < 3000);
}
