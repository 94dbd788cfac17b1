use keeper_crypto::{decrypt_stream, encrypt_stream, VaultKey};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let rt = runtime();
    let key = VaultKey::from_bytes([0xAB; 32]);
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(async {
                let mut out = Vec::with_capacity(size + size / 64 + 64);
                encrypt_stream(divan::black_box(&data[..]), &mut out, &key)
                    .await
                    .unwrap();
                out
            })
        });
}

#[divan::bench(args = [1024, 65536, 1048576])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let rt = runtime();
    let key = VaultKey::from_bytes([0xAB; 32]);
    let data = make_data(size);
    let mut blob = Vec::new();
    rt.block_on(encrypt_stream(&data[..], &mut blob, &key)).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            rt.block_on(async {
                let mut out = Vec::with_capacity(size);
                decrypt_stream(divan::black_box(&blob[..]), &mut out, &key)
                    .await
                    .unwrap();
                out
            })
        });
}

fn main() {
    divan::main();
}
