//! End-to-end packaging tests on a toy Llama model.

use std::fs;
use std::io::Read;
use std::path::Path;

use candle_core::{Device, Tensor};
use llmpkg_storage::{
    ExportError, LlamaAttention, LlamaBlock, LlamaConfig, LlamaExporter, LlamaMlp, LlamaModel,
    MODEL_BIN, MODEL_INI, PackageArchive, Packager, QuantMode, RmsNorm, TOKENIZER_BIN,
    TOKENIZER_INI, TokenizerArtifacts,
};
use tempfile::tempdir;

fn config(hidden: usize, heads: usize, inter: usize, vocab: usize) -> LlamaConfig {
    serde_json::from_value(serde_json::json!({
        "hidden_size": hidden,
        "num_attention_heads": heads,
        "num_key_value_heads": 1,
        "intermediate_size": inter,
        "rms_norm_eps": 1e-5,
        "num_hidden_layers": 2,
        "vocab_size": vocab,
        "max_position_embeddings": 16
    }))
    .unwrap()
}

fn weight(rows: usize, cols: usize, seed: usize) -> Tensor {
    let data: Vec<f32> = (0..rows * cols)
        .map(|i| ((i * 13 + seed * 7) % 101) as f32 / 50.0 - 1.0)
        .collect();
    Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
}

fn ones(size: usize) -> RmsNorm {
    RmsNorm {
        weight: Tensor::ones(size, candle_core::DType::F32, &Device::Cpu).unwrap(),
    }
}

fn model(config: LlamaConfig) -> LlamaModel {
    let h = config.hidden_size;
    let hd = config.head_dim();
    let kv = config.num_key_value_heads() * hd;
    let q = config.num_attention_heads * hd;
    let inter = config.intermediate_size;

    let layers = (0..config.num_hidden_layers)
        .map(|i| LlamaBlock {
            input_norm: ones(h),
            attn: LlamaAttention {
                q_proj: weight(q, h, i),
                k_proj: weight(kv, h, i + 1),
                v_proj: weight(kv, h, i + 2),
                o_proj: weight(h, q, i + 3),
                rotary_emb: Some(config.rotary_embedding()),
            },
            post_attn_norm: ones(h),
            mlp: LlamaMlp {
                gate_proj: weight(inter, h, i + 4),
                up_proj: weight(inter, h, i + 5),
                down_proj: weight(h, inter, i + 6),
            },
        })
        .collect();

    LlamaModel {
        embed_tokens: weight(config.vocab_size, h, 40),
        norm: ones(h),
        layers,
        lm_head: weight(config.vocab_size, h, 41),
        config,
    }
}

fn tokenizer() -> TokenizerArtifacts {
    TokenizerArtifacts::new(b"\x00tokenizer-bytes\xff".to_vec(), "[tokenizer]\ntype = bpe\n")
}

fn read_zip_entry(path: &Path, name: &str) -> Vec<u8> {
    let file = fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    assert_eq!(entry.compression(), zip::CompressionMethod::Stored, "{name}");
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes).unwrap();
    bytes
}

// ==================== archive layout tests ====================

#[test]
fn test_package_has_four_stored_entries() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");

    let summary = Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();

    assert_eq!(summary.path, dest);
    assert_eq!(summary.tensor_count, 4 + 6 * 2);
    assert!(dest.exists());
    assert_eq!(fs::metadata(&dest).unwrap().len(), summary.archive_bytes);

    let package = PackageArchive::open(&dest).unwrap();
    let mut entries = package.entries.clone();
    entries.sort();
    assert_eq!(entries, vec![MODEL_BIN, MODEL_INI, TOKENIZER_BIN, TOKENIZER_INI]);

    for name in [MODEL_BIN, MODEL_INI, TOKENIZER_BIN, TOKENIZER_INI] {
        read_zip_entry(&dest, name);
    }
}

#[test]
fn test_config_references_tensor_stream() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");
    Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();

    let ini = String::from_utf8(read_zip_entry(&dest, MODEL_INI)).unwrap();
    assert!(ini.starts_with("[llama]\nhidden_size = 8\n"));
    assert!(ini.contains("\n[model]\ntype = llama\nmodel_file = model.bin\n"));

    let package = PackageArchive::open(&dest).unwrap();
    assert_eq!(package.config.get("model", "model_file"), Some(MODEL_BIN));
    assert_eq!(package.config.get("llama", "num_layers"), Some("2"));
    assert_eq!(package.tensors.len(), 16);
    assert!(package.tensors.contains("llama.block1.mlp.down_proj.weight"));
}

#[test]
fn test_tokenizer_entries_are_verbatim() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");
    Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();

    let package = PackageArchive::open(&dest).unwrap();
    assert_eq!(package.tokenizer, tokenizer());
}

#[test]
fn test_overrides_replace_placeholder_token_ids() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");
    let summary = Packager::new(&dest, tokenizer())
        .config_override("bot_token_id", 128000)
        .config_override("eot_token_id", 128001)
        .config_override("eot_id", 128009)
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();

    let section = summary.config.section("llama").unwrap();
    assert_eq!(section.get("bot_token_id"), Some("128000"));
    assert_eq!(section.get("eot_token_id"), Some("128001"));
    assert_eq!(section.get("eot_id"), Some("128009"));

    // Replaced in place, new key appended last
    let keys: Vec<&str> = section.entries().iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(&keys[8..], ["bot_token_id", "eot_token_id", "eot_id"]);

    let package = PackageArchive::open(&dest).unwrap();
    assert_eq!(package.config.get("llama", "eot_id"), Some("128009"));
}

// ==================== quantization tests ====================

#[test]
fn test_q4_package_decodes_close_to_source() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("q4.llmpkg");
    let source = model(config(32, 2, 64, 64));
    Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &source, QuantMode::Q4)
        .unwrap();

    let mut package = PackageArchive::open(&dest).unwrap();
    let embd = package.tensors.read("llama.embd").unwrap();
    assert_eq!(embd.quant, QuantMode::Q4);
    assert_eq!(embd.shape, vec![64, 32]);

    let decoded = embd.to_f32().unwrap();
    let original = source.embed_tokens.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    // Values lie in [-1, 1], so the scale is at most 2 / 15
    for (a, b) in original.iter().zip(&decoded) {
        assert!((a - b).abs() <= 0.51 * 2.0 / 15.0 + 1e-3, "{a} vs {b}");
    }

    let norm = package.tensors.read("llama.norm.weight").unwrap();
    assert_eq!(norm.quant, QuantMode::None);
    assert_eq!(norm.to_f32().unwrap(), vec![1.0; 32]);
}

#[test]
fn test_reexport_is_byte_identical() {
    let dir = tempdir().unwrap();
    let source = model(config(32, 2, 64, 64));

    let a = dir.path().join("a.llmpkg");
    let b = dir.path().join("b.llmpkg");
    for dest in [&a, &b] {
        Packager::new(dest, tokenizer())
            .build(&LlamaExporter, &source, QuantMode::Q4)
            .unwrap();
    }

    assert_eq!(read_zip_entry(&a, MODEL_BIN), read_zip_entry(&b, MODEL_BIN));
    assert_eq!(read_zip_entry(&a, MODEL_INI), read_zip_entry(&b, MODEL_INI));
}

#[test]
fn test_existing_destination_is_replaced() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");
    fs::write(&dest, b"stale").unwrap();

    Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();

    assert!(PackageArchive::open(&dest).is_ok());
}

// ==================== failure tests ====================

fn dir_is_empty(path: &Path) -> bool {
    fs::read_dir(path).unwrap().next().is_none()
}

#[test]
fn test_tensor_parallel_config_leaves_no_file() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("tp.llmpkg");

    let mut cfg = config(8, 1, 16, 32);
    cfg.pretraining_tp = 2;
    let err = Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(cfg), QuantMode::None)
        .unwrap_err();

    assert!(matches!(err, ExportError::UnsupportedConfiguration(_)));
    assert!(!dest.exists());
    assert!(dir_is_empty(dir.path()));
}

#[test]
fn test_mid_stream_failure_leaves_no_file() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("bad.llmpkg");

    // Hidden size 8 cannot be split into Q4 groups of 32
    let err = Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::Q4)
        .unwrap_err();

    assert!(matches!(err, ExportError::Shape { .. }));
    assert!(!dest.exists());
    assert!(dir_is_empty(dir.path()));
}

#[test]
fn test_failed_export_keeps_previous_package() {
    let dir = tempdir().unwrap();
    let dest = dir.path().join("toy.llmpkg");
    Packager::new(&dest, tokenizer())
        .build(&LlamaExporter, &model(config(8, 1, 16, 32)), QuantMode::None)
        .unwrap();
    let before = fs::read(&dest).unwrap();

    let result = Packager::new(&dest, tokenizer()).build(
        &LlamaExporter,
        &model(config(8, 1, 16, 32)),
        QuantMode::Q4,
    );

    assert!(result.is_err());
    assert_eq!(fs::read(&dest).unwrap(), before);
}
