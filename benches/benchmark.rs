use byteorder::{LittleEndian, WriteBytesExt};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use unpickler::{DeOptions, value_from_slice, parse_slice};

fn bench_pickle(c: &mut Criterion, name: &str, contents: &[u8]) {
    c.bench_function(name, |b| {
        b.iter(|| value_from_slice(black_box(contents), DeOptions::new()).unwrap())
    });
}

/// A list of 1000 one-element lists, each memoized.
fn biglist() -> Vec<u8> {
    let mut buffer = b"\x80\x02]q\x00(".to_vec();
    for i in 0..1000 {
        buffer.extend(b"]r");
        buffer.write_u32::<LittleEndian>(i + 1).unwrap();
        buffer.push(b'M');
        buffer.write_u16::<LittleEndian>(i as u16).unwrap();
        buffer.push(b'a');
    }
    buffer.extend(b"e.");
    buffer
}

/// One list referenced 1000 times through the memo.
fn manyrefs() -> Vec<u8> {
    let mut buffer = b"\x80\x04]\x94(K\x01K\x02e]\x94(".to_vec();
    for _ in 0..1000 {
        buffer.extend(b"h\x00");
    }
    buffer.extend(b"e.");
    buffer
}

/// Protocol 0 dict with 1000 string items.
fn manystrings() -> Vec<u8> {
    let mut buffer = b"(dp0\n".to_vec();
    for i in 0..1000 {
        buffer.extend(format!("S'key{}'\nS'value{}'\ns", i, i).as_bytes());
    }
    buffer.push(b'.');
    buffer
}

pub fn criterion_benchmark(c: &mut Criterion) {
    bench_pickle(c, "biglist", &biglist());
    bench_pickle(c, "manyrefs", &manyrefs());
    bench_pickle(c, "manystrings", &manystrings());

    let strings = manystrings();
    c.bench_function("manystrings (parse only)", |b| {
        b.iter(|| parse_slice(black_box(&strings), None).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
