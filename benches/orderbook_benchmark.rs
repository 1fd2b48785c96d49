//! Benchmarks for order book reconstruction

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use orp_flow_stream::messages::{BookUpdateKind, PriceLevel};
use orp_flow_stream::orderbook::{BookReconstructor, FullBook};
use orp_flow_stream::{BookUpdate, Spread, Symbol};
use rust_decimal::Decimal;

fn symbol() -> Symbol {
    Symbol::new("XBT-USD")
}

fn create_snapshot(levels: usize) -> BookUpdate {
    let quantity = Decimal::new(15, 1);
    let bids = (0..levels)
        .map(|i| PriceLevel::new(Decimal::from(50000 - i as i64), quantity))
        .collect();
    let asks = (0..levels)
        .map(|i| PriceLevel::new(Decimal::from(50001 + i as i64), quantity))
        .collect();

    BookUpdate {
        symbol: symbol(),
        kind: BookUpdateKind::Snapshot,
        asks,
        bids,
        time: Utc::now(),
    }
}

fn create_delta() -> BookUpdate {
    BookUpdate {
        symbol: symbol(),
        kind: BookUpdateKind::Delta,
        asks: vec![PriceLevel::new(Decimal::from(50001), Decimal::new(25, 1))],
        bids: vec![PriceLevel::new(Decimal::from(49999), Decimal::new(20, 1))],
        time: Utc::now(),
    }
}

fn create_spread() -> Spread {
    Spread {
        symbol: symbol(),
        bid: Decimal::from(50000),
        ask: Decimal::from(50001),
        time: Utc::now(),
        bid_volume: None,
        ask_volume: None,
    }
}

fn benchmark_snapshot(c: &mut Criterion) {
    let snapshot = create_snapshot(100);

    c.bench_function("apply_snapshot_100_levels", |b| {
        b.iter(|| {
            let mut reconstructor = BookReconstructor::new(symbol(), 100);
            reconstructor.apply(black_box(&snapshot)).ok();
        })
    });
}

fn benchmark_delta_and_prune(c: &mut Criterion) {
    let mut reconstructor = BookReconstructor::new(symbol(), 100);
    reconstructor.apply(&create_snapshot(100)).ok();

    let delta = create_delta();
    let spread = create_spread();

    c.bench_function("apply_delta_and_prune", |b| {
        b.iter(|| {
            reconstructor.apply(black_box(&delta)).ok();
            reconstructor.prune(black_box(&spread));
        })
    });
}

fn benchmark_metrics_calculation(c: &mut Criterion) {
    let snapshot = create_snapshot(100);
    let mut book = FullBook::new(symbol(), 100);
    book.apply_snapshot(&snapshot.asks, &snapshot.bids, snapshot.time);

    c.bench_function("calculate_imbalance", |b| {
        b.iter(|| {
            black_box(book.imbalance(10));
        })
    });

    c.bench_function("calculate_weighted_imbalance", |b| {
        b.iter(|| {
            black_box(book.weighted_imbalance(10, Decimal::new(9, 1)));
        })
    });

    c.bench_function("full_book_view", |b| {
        b.iter(|| {
            black_box(book.view().ok());
        })
    });
}

criterion_group!(
    benches,
    benchmark_snapshot,
    benchmark_delta_and_prune,
    benchmark_metrics_calculation
);
criterion_main!(benches);
