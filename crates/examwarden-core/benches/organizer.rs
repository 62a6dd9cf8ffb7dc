use criterion::{black_box, criterion_group, criterion_main, Criterion};

use examwarden_core::model::{Question, QuestionId};
use examwarden_core::organizer::{organize, validate_groups};
use examwarden_core::sheet::parse_answer_sheet_str;

fn record(id: QuestionId, order: u32, group_id: Option<QuestionId>, answerable: bool) -> Question {
    let option = |text: &str| answerable.then(|| text.to_string());
    Question {
        id,
        order_number: order,
        prompt: format!("Question {id}"),
        option_a: option("a"),
        option_b: option("b"),
        option_c: option("c"),
        option_d: option("d"),
        audio_url: None,
        image_url: None,
        group_id,
    }
}

/// `groups` passages of `per_group` questions each, interleaved with as many
/// individual questions, shuffled by reversing.
fn generate_section(groups: usize, per_group: usize) -> Vec<Question> {
    let mut records = Vec::new();
    let mut order = 1u32;
    let mut next_id: QuestionId = 1;
    for _ in 0..groups {
        let parent_id = next_id;
        next_id += 1;
        records.push(record(parent_id, 0, Some(parent_id), false));
        for _ in 0..per_group {
            records.push(record(next_id, order, Some(parent_id), true));
            next_id += 1;
            order += 1;
        }
        records.push(record(next_id, order, None, true));
        next_id += 1;
        order += 1;
    }
    records.reverse();
    records
}

fn bench_organize(c: &mut Criterion) {
    let mut group = c.benchmark_group("organize");

    let small = generate_section(5, 3);
    let medium = generate_section(20, 5);
    let large = generate_section(100, 10);

    group.bench_function("5_groups", |b| b.iter(|| organize(black_box(&small))));
    group.bench_function("20_groups", |b| b.iter(|| organize(black_box(&medium))));
    group.bench_function("100_groups", |b| b.iter(|| organize(black_box(&large))));

    let organized = organize(&large);
    group.bench_function("validate_100_groups", |b| {
        b.iter(|| validate_groups(black_box(&organized.groups)))
    });

    group.finish();
}

fn bench_sheet_parsing(c: &mut Criterion) {
    let mut sheet = String::from("[sheet]\nset_id = 1\n");
    for i in 0..500 {
        let choice = ["A", "B", "C", "D"][i % 4];
        sheet.push_str(&format!("\n[[answers]]\nquestion_id = {i}\nchoice = \"{choice}\"\n"));
    }

    c.bench_function("parse_sheet_500_answers", |b| {
        b.iter(|| parse_answer_sheet_str(black_box(&sheet), black_box("bench.toml".as_ref())))
    });
}

criterion_group!(benches, bench_organize, bench_sheet_parsing);
criterion_main!(benches);
