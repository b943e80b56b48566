// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use antler_lib::bloom::BloomFilter;
use antler_lib::diff::diff_items;
use antler_lib::diff::patch_item;
use antler_lib::item::Item;
use antler_lib::richtext::RichText;
use antler_lib::schema::FieldMap;
use antler_lib::schema::FieldSpec;
use antler_lib::schema::Schema;
use antler_lib::value::FieldType;
use antler_lib::value::Value;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;

fn bench_schema() -> Arc<Schema> {
    Schema::new("bench", 1)
        .field("title", FieldSpec::new(FieldType::String))
        .field("count", FieldSpec::new(FieldType::Number))
        .field("tags", FieldSpec::new(FieldType::Set))
        .field("body", FieldSpec::new(FieldType::RichText))
        .build()
}

fn wide_item(tag_count: usize) -> Item {
    let mut item = Item::new(bench_schema(), FieldMap::new()).unwrap();
    item.set("title", "benchmark").unwrap();
    item.set("count", 42_i64).unwrap();
    item.set(
        "tags",
        Value::Set((0..tag_count).map(|i| Value::from(format!("tag-{i}"))).collect()),
    )
    .unwrap();
    item.set(
        "body",
        RichText::new((0..64).map(|i| format!("paragraph number {i}")).collect()),
    )
    .unwrap();
    item
}

fn bench_item_diff(c: &mut Criterion) {
    let base = wide_item(128);
    let mut edited = base.clone_unlocked();
    edited.set("count", 43_i64).unwrap();
    edited
        .set(
            "tags",
            Value::Set((64..192).map(|i| Value::from(format!("tag-{i}"))).collect()),
        )
        .unwrap();
    c.bench_function("diff_wide_item", |b| {
        b.iter(|| diff_items(&base, &edited, false))
    });

    let changes = diff_items(&base, &edited, false);
    c.bench_function("patch_wide_item", |b| {
        b.iter(|| {
            let mut target = base.clone_unlocked();
            patch_item(&mut target, &changes).unwrap();
            target
        })
    });
}

fn bench_checksum(c: &mut Criterion) {
    let item = wide_item(256);
    c.bench_function("checksum_wide_item", |b| {
        b.iter(|| item.clone_unlocked().checksum())
    });
}

fn bench_bloom(c: &mut Criterion) {
    let mut filter = BloomFilter::new(10_000, 0.01);
    for i in 0..10_000 {
        filter.insert(&format!("/data/bench/{i:06}"));
    }
    c.bench_function("bloom_membership", |b| {
        let mut i = 0_u64;
        b.iter(|| {
            i = i.wrapping_add(1);
            filter.has(&format!("/data/bench/{:06}", i % 20_000))
        })
    });
}

criterion_group!(benches, bench_item_diff, bench_checksum, bench_bloom);
criterion_main!(benches);
