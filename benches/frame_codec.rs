use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rlpx::{Frame, FrameCodec, Handshake, KeyPair};

fn codec_pair() -> (FrameCodec, FrameCodec) {
    let alice = KeyPair::random();
    let bob = KeyPair::random();
    let mut initiator = Handshake::initiator(alice, *bob.public());
    let mut responder = Handshake::responder(bob);

    let auth = initiator.write_auth().unwrap();
    responder.read_auth(&auth).unwrap();
    let ack = responder.write_ack().unwrap();
    initiator.read_ack(&ack).unwrap();

    (
        FrameCodec::new(initiator.secrets().unwrap()),
        FrameCodec::new(responder.secrets().unwrap()),
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    for size in [16usize, 1024, 16 * 1024] {
        let (mut egress, _) = codec_pair();
        let frame = Frame::new(0x10, vec![0xab; size]);
        group.bench_function(format!("{size}B"), |b| {
            b.iter(|| egress.encode(black_box(&frame)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    for size in [16usize, 1024, 16 * 1024] {
        group.bench_function(format!("{size}B"), |b| {
            b.iter_batched(
                || {
                    let (mut egress, ingress) = codec_pair();
                    let wire = egress.encode(&Frame::new(0x10, vec![0xab; size])).unwrap();
                    (ingress, wire)
                },
                |(mut ingress, wire)| ingress.decode(black_box(&wire)).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
