use criterion::{black_box, criterion_group, criterion_main, Criterion};

use wavry_common::{Direction, PoolConfig};
use wavry_media::BufferPool;

fn bench_obtain_recycle(c: &mut Criterion) {
    let config = PoolConfig {
        default_size: 64 * 1024,
        max_buffers: 16,
        max_total_bytes: 16 * 64 * 1024,
    };

    c.bench_function("buffer_pool_obtain_recycle", |b| {
        let mut pool = BufferPool::new(Direction::Input, config);
        b.iter(|| {
            let buffer = pool.obtain(black_box(4096)).unwrap();
            pool.recycle(buffer);
        })
    });

    c.bench_function("buffer_pool_growing_working_set", |b| {
        b.iter(|| {
            let mut pool = BufferPool::new(Direction::Input, PoolConfig::default());
            let mut held = Vec::with_capacity(8);
            for size in [1024usize, 2048, 4096, 8192, 16384, 32768, 65536, 131072] {
                pool.set_default_size(size);
                held.push(pool.obtain(black_box(size / 2)).unwrap());
                if held.len() > 2 {
                    pool.recycle(held.remove(0));
                }
            }
            for buffer in held {
                pool.recycle(buffer);
            }
        })
    });
}

criterion_group!(benches, bench_obtain_recycle);
criterion_main!(benches);
