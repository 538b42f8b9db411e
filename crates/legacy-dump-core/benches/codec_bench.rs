use criterion::{criterion_group, criterion_main, Criterion};
use legacy_dump_core::{decode, encode, SerializedValue};

fn mk_menu(entries: usize) -> SerializedValue {
    let buttons = (0..entries)
        .map(|index| {
            let index_i64 = i64::try_from(index).unwrap_or(i64::MAX);
            let price = 0.5 + f64::from(u32::try_from(index).unwrap_or(0));
            let button = SerializedValue::Array(vec![
                (SerializedValue::str("type"), SerializedValue::str("view")),
                (SerializedValue::str("name"), SerializedValue::str(format!("菜单 {index}"))),
                (
                    SerializedValue::str("url"),
                    SerializedValue::str(format!("https://example.invalid/shop/{index}")),
                ),
                (SerializedValue::str("price"), SerializedValue::float(price)),
            ]);
            (SerializedValue::Int(index_i64), button)
        })
        .collect();
    SerializedValue::Array(vec![(SerializedValue::str("button"), SerializedValue::Array(buttons))])
}

fn bench_codec(c: &mut Criterion) {
    let menu = mk_menu(64);
    let encoded = encode(&menu);

    c.bench_function("decode_menu_64", |b| {
        b.iter(|| {
            let decoded = decode(&encoded);
            assert!(decoded.is_ok());
        });
    });

    c.bench_function("encode_menu_64", |b| {
        b.iter(|| {
            let bytes = encode(&menu);
            assert_eq!(bytes.len(), encoded.len());
        });
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
