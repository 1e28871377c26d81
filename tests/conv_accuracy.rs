// Convolution accuracy: every tier, tile width and variant against the
// integer reference, plus the float pipeline for overall numerics.
mod common;

use approx::assert_abs_diff_eq;
use common::{assert_same, init_logger, ConvFixture};
use qconv::kernels::conv_float_reference;
use qconv::{
    ActivationKind, CacheSizes, ConvOptions, ConvParam, ConvWeights, IoQuant, Quant, QuantizedConvolution, Tier,
    Variant,
};

fn scalar() -> ConvOptions {
    ConvOptions::default().with_tier(Tier::Scalar)
}

/// Every option set worth checking on this machine.
fn option_grid() -> Vec<ConvOptions> {
    let mut grid = Vec::new();
    for lanes in [4, 8, 16] {
        grid.push(scalar().with_lanes(lanes).with_micro_rows(3));
    }
    // tiny caches force split contraction, split channels and K-blocked staging
    grid.push(
        scalar()
            .with_lanes(8)
            .with_cache(CacheSizes::new(16 * 16, 2 * 1024, 4 * 1024)),
    );
    for tier in Tier::available() {
        grid.push(ConvOptions::default().with_tier(tier));
        grid.push(
            ConvOptions::default()
                .with_tier(tier)
                .with_cache(CacheSizes::new(512, 4 * 1024, 8 * 1024)),
        );
    }
    grid
}

fn pointwise_case(src: [u8; 4], zero: u8) -> Vec<u8> {
    let p = ConvParam::new(1, 4, 1, 1, 4, (1, 1));
    let weight = [1i8; 16];
    let scales = [1.0f32; 4];
    let io = IoQuant::new(Quant::new(1.0, zero), Quant::new(1.0, 0));
    let mut out = Vec::new();
    for options in option_grid() {
        let conv = QuantizedConvolution::new(p.clone(), io, ConvWeights::new(&weight, &scales), &options).unwrap();
        let mut dst = [0u8; 4];
        conv.forward(&src, None, &mut dst);
        out.extend_from_slice(&dst);
    }
    out
}

#[test]
fn test_pointwise_sum() {
    init_logger();
    let out = pointwise_case([10, 20, 30, 40], 0);
    assert!(out.iter().all(|&v| v == 100), "{out:?}");
}

#[test]
fn test_source_zero_point_cancels() {
    let out = pointwise_case([138, 148, 158, 168], 128);
    assert!(out.iter().all(|&v| v == 100), "{out:?}");
}

#[test]
fn test_3x3_edge_and_interior_agree() {
    init_logger();
    let p = ConvParam::new(1, 1, 5, 5, 1, (3, 3)).with_pad(1, 1, 1, 1);
    let src: Vec<u8> = (0..25).map(|v| v as u8 * 3).collect();
    let weight: [i8; 9] = [1, 2, 1, 0, -1, 0, -2, 3, 1];
    let io = IoQuant::new(Quant::new(1.0, 7), Quant::new(1.0, 100));
    let mut outputs = Vec::new();
    for variant in [
        Variant::NhwcGemm,
        Variant::NhwcDirect,
        Variant::NhwcDepthwise,
        Variant::NhwcDepthwise3x3,
        Variant::NhwcDepthwiseCyclic,
    ] {
        let conv = QuantizedConvolution::new(
            p.clone(),
            io,
            ConvWeights::new(&weight, &[1.0]),
            &scalar().with_variant(variant),
        )
        .unwrap();
        assert_eq!(conv.variant(), variant);
        let mut dst = vec![0u8; 25];
        conv.forward(&src, None, &mut dst);
        outputs.push(dst);
    }
    // centre pixel by hand: taps 6,7,8,11,12,13,16,17,18 times 3
    let centre: i32 = [6, 7, 8, 11, 12, 13, 16, 17, 18]
        .iter()
        .zip(weight)
        .map(|(&i, w)| (i * 3 - 7) * w as i32)
        .sum();
    assert_eq!(outputs[0][12] as i32, 100 + centre);
    for out in &outputs[1..] {
        assert_same(out, &outputs[0], "3x3 variants");
    }
}

fn check_against_reference(param: ConvParam, seed: u32) {
    let fixture = ConvFixture::new(param, seed, false);
    for options in option_grid() {
        let conv = fixture.build(&options);
        let got = fixture.run(&conv);
        let want = fixture.reference(&conv);
        assert_same(&got, &want, &format!("{} {}", conv.describe(), fixture.param));
    }
}

#[test]
fn test_gemm_shapes_match_reference() {
    init_logger();
    let shapes = [
        ConvParam::new(1, 3, 9, 7, 5, (3, 3)).with_pad(1, 1, 1, 1),
        ConvParam::new(2, 16, 6, 6, 24, (1, 1)),
        ConvParam::new(3, 8, 4, 4, 8, (1, 1)),
        ConvParam::new(1, 6, 11, 10, 13, (3, 2))
            .with_stride(2, 1)
            .with_dilation(1, 2)
            .with_pad(1, 0, 2, 1),
        ConvParam::new(1, 32, 7, 7, 40, (3, 3)).with_stride(2, 2).with_pad(0, 0, 1, 1),
        ConvParam::new(2, 12, 5, 5, 9, (5, 5)).with_pad(2, 2, 2, 2),
    ];
    for (i, p) in shapes.into_iter().enumerate() {
        check_against_reference(p, 100 + i as u32);
    }
}

#[test]
fn test_direct_matches_reference() {
    init_logger();
    let shapes = [
        ConvParam::new(2, 3, 12, 11, 16, (3, 3)).with_stride(2, 2).with_pad(1, 1, 1, 1),
        ConvParam::new(1, 1, 9, 9, 7, (5, 5)).with_pad(2, 2, 2, 2),
        ConvParam::new(1, 5, 8, 10, 33, (3, 3)).with_dilation(2, 1).with_pad(2, 1, 2, 1),
        ConvParam::new(2, 4, 6, 6, 12, (2, 3)).with_stride(1, 2).with_pad(0, 1, 1, 0),
    ];
    for (i, p) in shapes.into_iter().enumerate() {
        let fixture = ConvFixture::new(p, 500 + i as u32, false);
        for options in option_grid() {
            let conv = fixture.build(&options.with_variant(Variant::NhwcDirect));
            assert_same(&fixture.run(&conv), &fixture.reference(&conv), &format!("{} {}", conv.describe(), fixture.param));
        }
    }
}

#[test]
fn test_direct_row_ranges_compose() {
    let p = ConvParam::new(3, 3, 10, 7, 9, (3, 3)).with_pad(1, 1, 1, 1);
    let fixture = ConvFixture::new(p.clone(), 9, false);
    for tier in Tier::available() {
        let conv = fixture.build(&ConvOptions::default().with_tier(tier).with_variant(Variant::NhwcDirect));
        let full = fixture.run(&conv);
        assert_same(&full, &fixture.reference(&conv), &conv.describe());
        let mut parts = vec![0u8; p.dst_size()];
        let mut buf = vec![0u8; conv.external_buffer_size()];
        for (y0, y1) in [(4, 10), (0, 1), (1, 4)] {
            conv.forward_rows(&fixture.src, Some(&mut buf), &mut parts, y0, y1);
        }
        assert_same(&parts, &full, &conv.describe());
    }
}

/// With an even channel count both engines pair the same products.
#[test]
fn test_direct_agrees_with_gemm_on_even_channels() {
    let p = ConvParam::new(1, 4, 7, 7, 10, (3, 3)).with_pad(1, 1, 1, 1);
    let fixture = ConvFixture::new(p, 61, false);
    for options in option_grid() {
        let gemm = fixture.build(&options.clone().with_variant(Variant::NhwcGemm));
        let direct = fixture.build(&options.with_variant(Variant::NhwcDirect));
        assert_same(&fixture.run(&direct), &fixture.run(&gemm), &direct.describe());
    }
}

#[test]
fn test_grouped_and_depthwise_match_reference() {
    let shapes = [
        ConvParam::new(1, 8, 6, 6, 12, (3, 3)).with_group(4).with_pad(1, 1, 1, 1),
        ConvParam::new(2, 6, 5, 7, 6, (3, 3)).with_group(2),
        ConvParam::new(2, 24, 7, 7, 24, (3, 3)).with_group(24).with_pad(1, 1, 1, 1),
        ConvParam::new(1, 40, 9, 9, 40, (3, 3)).with_group(40).with_stride(2, 2).with_pad(1, 1, 1, 1),
        ConvParam::new(1, 10, 8, 8, 10, (5, 5)).with_group(10).with_pad(2, 2, 2, 2),
        ConvParam::new(1, 96, 6, 6, 96, (5, 5)).with_group(96).with_pad(2, 2, 2, 2),
        ConvParam::new(1, 7, 9, 8, 7, (3, 3)).with_group(7).with_dilation(2, 2).with_pad(2, 2, 2, 2),
    ];
    for (i, p) in shapes.into_iter().enumerate() {
        check_against_reference(p, 200 + i as u32);
    }
}

#[test]
fn test_forced_depthwise_variants_agree() {
    let p = ConvParam::new(2, 12, 8, 9, 12, (3, 3)).with_group(12).with_pad(1, 0, 1, 2);
    let fixture = ConvFixture::new(p, 7, false);
    let generic = fixture.run(&fixture.build(&scalar().with_variant(Variant::NhwcDepthwise)));
    for tier in Tier::available() {
        for variant in [Variant::NhwcDepthwise3x3, Variant::NhwcDepthwiseCyclic] {
            let conv = fixture.build(&ConvOptions::default().with_tier(tier).with_variant(variant));
            assert_same(&fixture.run(&conv), &generic, &conv.describe());
        }
    }
}

#[test]
fn test_activations_match_reference() {
    let kinds = [
        ActivationKind::Relu,
        ActivationKind::LeakyRelu,
        ActivationKind::RestrictRange,
        ActivationKind::Prelu,
        ActivationKind::Elu,
        ActivationKind::Hswish,
        ActivationKind::Mish,
        ActivationKind::HardSigmoid,
        ActivationKind::Swish,
        ActivationKind::Gelu,
    ];
    for (i, kind) in kinds.into_iter().enumerate() {
        let p = ConvParam::new(1, 8, 5, 5, 16, (3, 3)).with_pad(1, 1, 1, 1).with_activation(kind);
        check_against_reference(p, 300 + i as u32);
        let dw = ConvParam::new(1, 16, 5, 5, 16, (3, 3)).with_group(16).with_activation(kind);
        check_against_reference(dw, 400 + i as u32);
    }
}

#[test]
fn test_intermediate_domain() {
    let p = ConvParam::new(1, 8, 4, 4, 8, (1, 1)).with_activation(ActivationKind::Relu);
    let mut fixture = ConvFixture::new(p, 11, false);
    fixture.io = fixture.io.with_intermediate(Quant::new(0.03, 60));
    let conv = fixture.build(&scalar());
    assert_eq!(conv.context().intermediate, Quant::new(0.03, 60));
    assert_same(&fixture.run(&conv), &fixture.reference(&conv), "intermediate");
}

/// Padding must behave exactly like an input explicitly padded with the zero-point.
#[test]
fn test_padding_equals_explicit_border() {
    let padded = ConvParam::new(1, 5, 6, 7, 8, (3, 3)).with_pad(1, 2, 2, 1);
    let fixture = ConvFixture::new(padded.clone(), 21, false);
    let zero = fixture.io.src.zero;
    let (h, w) = (6 + 1 + 2, 7 + 2 + 1);
    let mut big = vec![zero; h * w * 5];
    for y in 0..6 {
        for x in 0..7 {
            let src = &fixture.src[(y * 7 + x) * 5..][..5];
            big[((y + 1) * w + x + 2) * 5..][..5].copy_from_slice(src);
        }
    }
    let plain = ConvParam::new(1, 5, h, w, 8, (3, 3));
    for options in option_grid() {
        let a = QuantizedConvolution::new(padded.clone(), fixture.io, fixture.weights(), &options).unwrap();
        let b = QuantizedConvolution::new(plain.clone(), fixture.io, fixture.weights(), &options).unwrap();
        let mut out_a = vec![0u8; padded.dst_size()];
        let mut out_b = vec![0u8; plain.dst_size()];
        a.forward(&fixture.src, None, &mut out_a);
        b.forward(&big, None, &mut out_b);
        assert_same(&out_a, &out_b, &a.describe());
    }
}

#[test]
fn test_row_ranges_compose() {
    for p in [
        ConvParam::new(2, 8, 9, 6, 16, (3, 3)).with_pad(1, 1, 1, 1),
        ConvParam::new(2, 12, 9, 6, 12, (3, 3)).with_group(12).with_pad(1, 1, 1, 1),
        ConvParam::new(1, 8, 10, 6, 8, (5, 3)).with_group(8).with_pad(2, 1, 2, 1),
    ] {
        let fixture = ConvFixture::new(p.clone(), 5, false);
        let conv = fixture.build(&ConvOptions::default());
        let full = fixture.run(&conv);
        let mut parts = vec![0u8; p.dst_size()];
        let mut buf = vec![0u8; conv.external_buffer_size()];
        let h = p.dst_h();
        for (y0, y1) in [(0, 2), (2, 3), (3, h)] {
            conv.forward_rows(&fixture.src, Some(&mut buf), &mut parts, y0, y1);
        }
        assert_same(&parts, &full, &conv.describe());
    }
}

#[test]
fn test_float_reference_within_two_codes() {
    init_logger();
    for (i, activation) in [ActivationKind::Identity, ActivationKind::Relu, ActivationKind::Hswish]
        .into_iter()
        .enumerate()
    {
        let p = ConvParam::new(1, 16, 7, 7, 24, (3, 3))
            .with_pad(1, 1, 1, 1)
            .with_activation(activation);
        let mut fixture = ConvFixture::new(p.clone(), 40 + i as u32, true);
        // keep pre-activation values well inside the intermediate range
        fixture.weight_scale.iter_mut().for_each(|s| *s *= 0.5);
        let conv = fixture.build(&ConvOptions::default());
        let got = fixture.run(&conv);
        let want = conv_float_reference(&p, &fixture.src, &fixture.weight, Some(&fixture.bias), conv.context());
        for (&a, &b) in got.iter().zip(&want) {
            assert_abs_diff_eq!(a as f32, b as f32, epsilon = 2.0);
        }
    }
}

#[test]
fn test_shared_instance_across_threads() {
    let p = ConvParam::new(1, 8, 12, 8, 8, (3, 3)).with_pad(1, 1, 1, 1);
    let fixture = ConvFixture::new(p.clone(), 77, false);
    let conv = fixture.build(&ConvOptions::default());
    let full = fixture.run(&conv);
    let split = 6 * p.dst_w() * p.dst_c;
    let mut parts = vec![0u8; p.dst_size()];
    let (top, bottom) = parts.split_at_mut(split);
    std::thread::scope(|s| {
        s.spawn(|| {
            let mut out = vec![0u8; p.dst_size()];
            conv.forward_rows(&fixture.src, None, &mut out, 0, 6);
            top.copy_from_slice(&out[..split]);
        });
        s.spawn(|| {
            let mut out = vec![0u8; p.dst_size()];
            conv.forward_rows(&fixture.src, None, &mut out, 6, p.dst_h());
            bottom.copy_from_slice(&out[split..]);
        });
    });
    assert_same(&parts, &full, "threads");
}
