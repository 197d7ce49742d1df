use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lumen_renderer::{DescriptorAllocator, DescriptorAllocatorPage, FenceTimeline};
use lumen_rhi::DescriptorHeapType;
use lumen_rhi::headless::HeadlessDevice;

fn bench_descriptor_page(c: &mut Criterion) {
    let device = Arc::new(HeadlessDevice::new());
    let page = DescriptorAllocatorPage::new(
        device.clone(),
        DescriptorHeapType::CbvSrvUav,
        4096,
        Arc::new(FenceTimeline::new()),
    )
    .unwrap();

    let mut group = c.benchmark_group("Descriptor Page");

    group.bench_function("allocate/free 64 mixed sizes", |b| {
        let mut fence = 0;
        b.iter(|| {
            let allocations: Vec<_> = (0..64)
                .filter_map(|i| page.allocate(1 + i % 8))
                .collect();
            fence += 1;
            for allocation in allocations {
                black_box(allocation.offset());
                allocation.free_at(fence);
            }
            page.release_stale_descriptors(fence);
        });
    });

    let allocator = DescriptorAllocator::new(
        device,
        DescriptorHeapType::CbvSrvUav,
        256,
        Arc::new(FenceTimeline::new()),
    );

    group.bench_function("allocator single descriptors", |b| {
        let mut fence = 0;
        b.iter(|| {
            let allocations: Vec<_> = (0..256)
                .map(|_| allocator.allocate(1).unwrap())
                .collect();
            fence += 1;
            for allocation in allocations {
                allocation.free_at(fence);
            }
            allocator.release_stale_descriptors(fence);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_descriptor_page);
criterion_main!(benches);
