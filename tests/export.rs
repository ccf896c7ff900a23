//! Weights file produced from a freshly built network.

use leelaz_train_rs::export::FORMAT_VERSION;
use leelaz_train_rs::prelude::*;
use leelaz_train_rs::registry::TensorRole;

fn export_text(config: &NetworkConfig, seed: u64) -> String {
    let ctx = ExecutionContext::cpu();
    let net = LeelazNet::new(config, &ctx, seed).unwrap();
    let mut out = Vec::new();
    WeightExporter::new(net.registry(), &net)
        .write(&mut out)
        .unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn test_default_network_exports_67_lines() {
    let config = NetworkConfig::leela_zero();
    let text = export_text(&config, 42);
    let lines: Vec<&str> = text.split('\n').collect();

    assert_eq!(lines.len(), 67);
    assert_eq!(lines[0], FORMAT_VERSION);
    assert!(!text.ends_with('\n'));

    let counts: Vec<usize> = lines[1..]
        .iter()
        .map(|l| l.split(' ').count())
        .collect();
    // stem: 3x3x18x128 kernel, then bias, mean, variance of 128
    assert_eq!(&counts[..4], &[9 * 18 * 128, 128, 128, 128]);
    // value head tail: fc1 weight, fc1 bias, fc2 weight, fc2 bias
    assert_eq!(&counts[62..], &[361 * 256, 256, 256, 1]);
    // policy fc
    assert_eq!(counts[56], 722 * 362);
}

#[test]
fn test_fresh_statistics_export_as_zero_mean_unit_variance() {
    let config = NetworkConfig::test();
    let text = export_text(&config, 0);
    let ctx = ExecutionContext::cpu();
    let net = LeelazNet::new(&config, &ctx, 0).unwrap();

    for (line, role) in text.split('\n').skip(1).zip(net.registry().roles()) {
        let values: Vec<f32> = line.split(' ').map(|v| v.parse().unwrap()).collect();
        match role {
            TensorRole::BnMovingMean | TensorRole::ConvBias | TensorRole::FcBias => {
                assert!(values.iter().all(|v| *v == 0.0), "{role}")
            }
            TensorRole::BnMovingVariance => assert!(values.iter().all(|v| *v == 1.0)),
            TensorRole::ConvWeight | TensorRole::FcWeight => {
                assert!(values.iter().all(|v| v.abs() <= 0.2), "{role}")
            }
        }
    }
}

#[test]
fn test_export_is_deterministic_per_seed() {
    let config = NetworkConfig::test();
    assert_eq!(export_text(&config, 5), export_text(&config, 5));
    assert_ne!(export_text(&config, 5), export_text(&config, 6));
}

#[test]
fn test_values_parse_back_exactly() {
    let config = NetworkConfig::test();
    let ctx = ExecutionContext::cpu();
    let net = LeelazNet::new(&config, &ctx, 9).unwrap();
    let mut out = Vec::new();
    WeightExporter::new(net.registry(), &net)
        .write(&mut out)
        .unwrap();
    let text = String::from_utf8(out).unwrap();

    // First entry is the stem kernel, stored [kh, kw, in, out].
    let stem_line = text.split('\n').nth(1).unwrap();
    let parsed: Vec<f32> = stem_line.split(' ').map(|v| v.parse().unwrap()).collect();
    let (name, var) = net
        .named_params()
        .unwrap()
        .into_iter()
        .find(|(n, _)| n == "stem.weight")
        .unwrap();
    let stored = var
        .as_tensor()
        .permute((3, 2, 0, 1))
        .unwrap()
        .contiguous()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();
    assert_eq!(parsed, stored, "{name}");
}
