use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ddxp::abi::{solidity_sha3, AbiValue};
use ddxp::agreement::agreement_hash;
use ddxp::conditions::{generate_id, ConditionParams};
use ddxp::template::TemplateDefinition;
use ddxp::{Address, Bytes32};

fn bench_condition_hashing(c: &mut Criterion) {
    let params = ConditionParams::EscrowReward {
        amount: 100,
        receiver: Address([1u8; 20]),
        sender: Address([2u8; 20]),
        lock_condition: Bytes32([3u8; 32]),
        release_condition: Bytes32([4u8; 32]),
    };
    let agreement_id = Bytes32([5u8; 32]);
    let contract = Address([6u8; 20]);

    c.bench_function("escrow_value_hash", |b| b.iter(|| black_box(&params).hash_values()));
    c.bench_function("condition_id", |b| {
        let value_hash = params.hash_values();
        b.iter(|| generate_id(black_box(&agreement_id), &contract, &value_hash))
    });
}

fn bench_agreement_hash(c: &mut Criterion) {
    let template_id = TemplateDefinition::id_for("EscrowAccessSecretStoreTemplate");
    let value_hashes: Vec<Bytes32> = (0..3u8).map(|i| Bytes32([i; 32])).collect();
    let timelocks = vec![0u64; 3];
    let timeouts = vec![0u64, 100, 0];
    let agreement_id = Bytes32([9u8; 32]);

    c.bench_function("agreement_hash", |b| {
        b.iter(|| {
            agreement_hash(
                black_box(&template_id),
                black_box(&value_hashes),
                &timelocks,
                &timeouts,
                &agreement_id,
            )
        })
    });
    c.bench_function("dependency_matrix", |b| {
        let template = TemplateDefinition::escrow_access_secret_store();
        b.iter(|| black_box(&template).dependency_matrix())
    });
    c.bench_function("packed_string", |b| {
        let value = vec![AbiValue::String("EscrowAccessSecretStoreTemplate".to_string())];
        b.iter(|| solidity_sha3(black_box(&value)))
    });
}

criterion_group!(benches, bench_condition_hashing, bench_agreement_hash);
criterion_main!(benches);
