mod common;

use std::time::Duration;

use rand::Rng;

use nvlog::device::StorageDevice;
use nvlog::{AppendRequest, Durability, LogEngine};

use common::{engine, fuzz_params, namespace, rng};

/// Expected state of one log.
#[derive(Default)]
struct Model {
    id: u32,
    name: String,
    payloads: Vec<Vec<u8>>,
    head: i64,
    version: i64,
    next_offset: u64,
}

fn verify<D: StorageDevice>(engine: &LogEngine<D>, model: &Model) {
    let metadata = engine.log_metadata(model.id).expect("metadata");
    assert_eq!(metadata.tail, model.payloads.len() as i64, "{}", model.name);
    assert_eq!(metadata.head, model.head, "{}", model.name);
    assert_eq!(metadata.version, model.version, "{}", model.name);
    for index in model.head as usize..model.payloads.len() {
        let got = engine.read_data(model.id, index as u64).expect("read_data");
        assert_eq!(got, model.payloads[index], "{} entry {index}", model.name);
    }
}

#[test]
fn fuzz_append_trim_reopen() {
    let (seed, steps) = fuzz_params("append_trim_reopen", 300);
    let mut rng = rng(seed);
    let ns = namespace();
    let mut engine = engine(&ns);

    let mut models: Vec<Model> = (0..3)
        .map(|i| {
            let name = format!("fuzz-{i}");
            let log = engine.load(&name).expect("load");
            Model {
                id: log.id,
                name,
                version: log.metadata.version,
                ..Model::default()
            }
        })
        .collect();

    for _ in 0..steps {
        let model = &mut models[rng.gen_range(0..3)];
        let sector = engine.geometry().sector_size() as u64;

        match rng.gen_range(0..100) {
            0..=79 => {
                let len = rng.gen_range(0usize..=3000);
                let mut data = vec![0u8; len];
                rng.fill(&mut data[..]);

                let committed = engine.log_metadata(model.id).expect("metadata");
                let version = model.version + rng.gen_range(1..=3);
                let request =
                    AppendRequest::at_tail(&committed, data.clone(), model.next_offset, version);
                if rng.gen_bool(0.5) {
                    engine
                        .append(model.id, request, Durability::Sync)
                        .expect("append");
                } else {
                    engine
                        .append(model.id, request, Durability::Async)
                        .expect("append");
                    assert!(engine
                        .wait_for_version(model.id, version, Duration::from_secs(10))
                        .expect("wait"));
                }

                model.next_offset += (len as u64).div_ceil(sector) * sector;
                model.payloads.push(data);
                model.version = version;
            }
            80..=89 => {
                let tail = model.payloads.len() as i64;
                if model.head == tail {
                    continue;
                }
                let mut metadata = engine.log_metadata(model.id).expect("metadata");
                metadata.head = rng.gen_range(model.head..=tail);
                metadata.version = model.version + 1;
                engine
                    .update_metadata(model.id, metadata.clone(), Durability::Sync)
                    .expect("update_metadata");
                model.head = metadata.head;
                model.version = metadata.version;
            }
            _ => {
                drop(engine);
                engine = common::engine(&ns);
                for model in &models {
                    assert_eq!(engine.load(&model.name).expect("reload").id, model.id);
                }
            }
        }
    }

    for model in &models {
        verify(&engine, model);
    }
}
