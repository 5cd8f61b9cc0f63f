//! Tests for quantization module.

use super::q4::{self, GROUP_SIZE, Q4Data};
use super::*;
use candle_core::Device;
use proptest::prelude::*;

fn max_error(original: &[f32], decoded: &[f32]) -> f32 {
    original
        .iter()
        .zip(decoded)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max)
}

/// Per-group error allowed by round-to-nearest against an f16 scale.
fn group_tolerance(data: &Q4Data, group: usize) -> f32 {
    0.51 * data.scales[group].to_f32() + 1e-6
}

// ==================== QuantMode tests ====================

#[test]
fn test_quant_mode_parse() {
    assert_eq!("none".parse::<QuantMode>().unwrap(), QuantMode::None);
    assert_eq!("Q4".parse::<QuantMode>().unwrap(), QuantMode::Q4);
    let err = "q8".parse::<QuantMode>().unwrap_err();
    assert!(matches!(err, ExportError::UnknownQuantMode(ref s) if s == "q8"));
}

#[test]
fn test_quant_mode_tags_and_display() {
    assert_eq!(QuantMode::from_tag(QuantMode::None.tag()), Some(QuantMode::None));
    assert_eq!(QuantMode::from_tag(QuantMode::Q4.tag()), Some(QuantMode::Q4));
    assert_eq!(QuantMode::from_tag(2), None);
    assert_eq!(QuantMode::Q4.to_string(), "q4");
    assert_eq!(QuantMode::default(), QuantMode::Q4);
}

// ==================== None codec tests ====================

#[test]
fn test_none_keeps_native_f32_bytes() {
    let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.25 - 1.0).collect();
    let tensor = Tensor::from_vec(data.clone(), (3, 4), &Device::Cpu).unwrap();

    let q = quantize("t", &tensor, QuantMode::None).unwrap();

    let expected: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(q.payload, expected);
    assert!(q.metadata.is_empty());
    assert_eq!(q.shape, vec![3, 4]);
    assert_eq!(q.element_type, ElementType::F32);

    let decoded = dequantize("t", q.mode, q.element_type, &q.shape, &q.payload, &q.metadata).unwrap();
    assert_eq!(decoded, data);
}

#[test]
fn test_none_keeps_native_bf16_bytes() {
    let data: Vec<bf16> = [1.5f32, -2.0, 0.125, 3.0].iter().map(|&v| bf16::from_f32(v)).collect();
    let tensor = Tensor::from_vec(data.clone(), 4, &Device::Cpu).unwrap();

    let q = quantize("t", &tensor, QuantMode::None).unwrap();

    let expected: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(q.payload, expected);
    assert_eq!(q.element_type, ElementType::BF16);
}

#[test]
fn test_none_accepts_integer_tensors() {
    let tensor = Tensor::from_vec(vec![1u32, 2, 3], 3, &Device::Cpu).unwrap();
    let q = quantize("ids", &tensor, QuantMode::None).unwrap();
    assert_eq!(q.payload.len(), 12);
    assert_eq!(&q.payload[4..8], &2u32.to_le_bytes());
}

#[test]
fn test_none_rejects_payload_length_mismatch() {
    let err = dequantize("t", QuantMode::None, ElementType::F32, &[2], &[0u8; 4], &[]).unwrap_err();
    assert!(matches!(err, ExportError::InvalidStream(_)));
}

// ==================== Q4 codec tests ====================

#[test]
fn test_q4_layout_sizes() {
    let data: Vec<f32> = (0..96).map(|i| (i as f32).sin()).collect();
    let tensor = Tensor::from_vec(data, (3, 32), &Device::Cpu).unwrap();

    let q = quantize("w", &tensor, QuantMode::Q4).unwrap();

    assert_eq!(q.payload.len(), 48); // 96 nibbles
    // 3 f16 scales + 2 bytes of zero points (odd group count rounds up)
    assert_eq!(q.metadata.len(), 3 * 2 + 2);
}

#[test]
fn test_q4_error_is_bounded_by_scale() {
    let data: Vec<f32> = (0..128).map(|i| ((i * 37) % 101) as f32 / 25.0 - 2.0).collect();
    let encoded = q4::encode("w", &data, &[2, 64]).unwrap();
    let decoded = encoded.decode();

    for (group, (orig, dec)) in data
        .chunks_exact(GROUP_SIZE)
        .zip(decoded.chunks_exact(GROUP_SIZE))
        .enumerate()
    {
        let err = max_error(orig, dec);
        assert!(
            err <= group_tolerance(&encoded, group),
            "group {group}: error {err} exceeds tolerance"
        );
    }
}

#[test]
fn test_q4_known_group() {
    // Range [-1, 2] -> scale 0.2, zero 5
    let mut data = vec![0.0f32; GROUP_SIZE];
    data[0] = -1.0;
    data[1] = 2.0;
    data[2] = 0.4;

    let encoded = q4::encode("w", &data, &[GROUP_SIZE]).unwrap();

    assert_eq!(encoded.scales[0], half::f16::from_f32(0.2));
    assert_eq!(encoded.zero_point(0), 5);
    assert_eq!(encoded.packed[0], 0x0F << 4); // q(-1)=0 low, q(2)=15 high
    assert_eq!(encoded.packed[1] & 0x0F, 7); // 0.4 / 0.2 + 5
    assert_eq!(encoded.packed[1] >> 4, 5); // zero maps to the zero point
}

#[test]
fn test_q4_all_positive_group_keeps_zero_in_range() {
    let data: Vec<f32> = (0..GROUP_SIZE).map(|i| 10.0 + i as f32 * 0.1).collect();
    let encoded = q4::encode("w", &data, &[GROUP_SIZE]).unwrap();

    assert_eq!(encoded.zero_point(0), 0);
    assert!(max_error(&data, &encoded.decode()) <= group_tolerance(&encoded, 0));
}

#[test]
fn test_q4_constant_zero_group() {
    let data = vec![0.0f32; GROUP_SIZE * 2];
    let encoded = q4::encode("w", &data, &[2, GROUP_SIZE]).unwrap();

    assert!(encoded.packed.iter().all(|&b| b == 0));
    assert!(encoded.scales.iter().all(|s| s.to_f32() == 0.0));
    assert_eq!(encoded.decode(), data);
}

#[test]
fn test_q4_zero_points_pack_two_per_byte() {
    // Group 0 is all-positive (zero 0), group 1 all-negative (zero 15)
    let mut data: Vec<f32> = (0..GROUP_SIZE).map(|i| 1.0 + i as f32).collect();
    data.extend((0..GROUP_SIZE).map(|i| -1.0 - i as f32));

    let encoded = q4::encode("w", &data, &[2 * GROUP_SIZE]).unwrap();

    assert_eq!(encoded.zeros.len(), 1);
    assert_eq!(encoded.zero_point(0), 0);
    assert_eq!(encoded.zero_point(1), 15);
    assert_eq!(encoded.zeros[0], 0xF0);
}

#[test]
fn test_q4_rejects_unaligned_innermost_dim() {
    let tensor = Tensor::zeros((2, 48), candle_core::DType::F32, &Device::Cpu).unwrap();
    let err = quantize("w", &tensor, QuantMode::Q4).unwrap_err();
    assert!(matches!(err, ExportError::Shape { .. }));
    assert!(err.to_string().contains("48"));

    // 64 total elements, but innermost 16 is still unaligned
    let tensor = Tensor::zeros((4, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
    assert!(matches!(
        quantize("w", &tensor, QuantMode::Q4),
        Err(ExportError::Shape { .. })
    ));
}

#[test]
fn test_q4_rejects_scalar() {
    let err = q4::encode("s", &[1.0], &[]).unwrap_err();
    assert!(matches!(err, ExportError::Shape { .. }));
}

#[test]
fn test_q4_rejects_integer_tensor() {
    let tensor = Tensor::zeros((1, 32), candle_core::DType::U32, &Device::Cpu).unwrap();
    let err = quantize("ids", &tensor, QuantMode::Q4).unwrap_err();
    assert!(matches!(
        err,
        ExportError::UnsupportedQuantMode {
            element_type: ElementType::U32,
            ..
        }
    ));
}

#[test]
fn test_q4_rejects_nan() {
    let mut data = vec![0.5f32; GROUP_SIZE];
    data[7] = f32::NAN;
    let err = q4::encode("w", &data, &[GROUP_SIZE]).unwrap_err();
    assert!(matches!(err, ExportError::NonFiniteValue(_)));
}

#[test]
fn test_q4_accepts_f16_input() {
    let data: Vec<f16> = (0..64).map(|i| f16::from_f32(i as f32 / 8.0 - 4.0)).collect();
    let tensor = Tensor::from_vec(data.clone(), (2, 32), &Device::Cpu).unwrap();

    let q = quantize("w", &tensor, QuantMode::Q4).unwrap();
    assert_eq!(q.element_type, ElementType::F16);

    let decoded = dequantize("w", q.mode, q.element_type, &q.shape, &q.payload, &q.metadata).unwrap();
    let original: Vec<f32> = data.iter().map(|v| v.to_f32()).collect();
    assert!(max_error(&original, &decoded) < 0.3);
}

#[test]
fn test_q4_from_parts_validates_lengths() {
    let err = Q4Data::from_parts("w", 64, &[0u8; 32], &[0u8; 3]).unwrap_err();
    assert!(matches!(err, ExportError::InvalidStream(_)));

    let err = Q4Data::from_parts("w", 40, &[0u8; 20], &[]).unwrap_err();
    assert!(matches!(err, ExportError::InvalidStream(_)));
}

#[test]
fn test_q4_is_deterministic() {
    let data: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.731).cos() * 3.0).collect();
    let a = q4::encode("w", &data, &[8, 32]).unwrap();
    let b = q4::encode("w", &data, &[8, 32]).unwrap();
    assert_eq!(a, b);
}

// ==================== Property tests ====================

proptest! {
    #[test]
    fn prop_q4_error_bounded_per_group(
        values in prop::collection::vec(-50.0f32..50.0f32, GROUP_SIZE * 4)
    ) {
        let encoded = q4::encode("w", &values, &[4, GROUP_SIZE]).unwrap();
        let decoded = encoded.decode();
        prop_assert_eq!(decoded.len(), values.len());

        for group in 0..encoded.num_groups() {
            let range = group * GROUP_SIZE..(group + 1) * GROUP_SIZE;
            let err = max_error(&values[range.clone()], &decoded[range]);
            prop_assert!(err <= group_tolerance(&encoded, group), "group {} error {}", group, err);
        }
    }

    #[test]
    fn prop_q4_metadata_round_trips(
        values in prop::collection::vec(-4.0f32..4.0f32, GROUP_SIZE * 3)
    ) {
        let encoded = q4::encode("w", &values, &[GROUP_SIZE * 3]).unwrap();
        let rebuilt = Q4Data::from_parts("w", values.len(), &encoded.packed, &encoded.metadata_bytes()).unwrap();
        prop_assert_eq!(rebuilt, encoded);
    }

    #[test]
    fn prop_q4_rejects_unaligned(cols in 1usize..200) {
        prop_assume!(cols % GROUP_SIZE != 0);
        let values = vec![0.0f32; cols];
        let is_shape_error = matches!(q4::encode("w", &values, &[cols]), Err(ExportError::Shape { .. }));
        prop_assert!(is_shape_error);
    }
}
