#![allow(dead_code)]

use qconv::kernels::conv_reference;
use qconv::{ActivationKind, ConvOptions, ConvParam, ConvWeights, IoQuant, Quant, QuantizedConvolution};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic LCG; test data must not depend on a RNG crate's version.
pub struct Lcg(u32);

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Self(seed)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.0 >> 8
    }

    pub fn bytes(&mut self, n: usize) -> Vec<u8> {
        (0..n).map(|_| self.next_u32() as u8).collect()
    }

    /// `n` values uniformly in `lo..=hi`.
    pub fn weights(&mut self, n: usize, lo: i8, hi: i8) -> Vec<i8> {
        let span = (hi as i32 - lo as i32 + 1) as u32;
        (0..n)
            .map(|_| (lo as i32 + (self.next_u32() % span) as i32) as i8)
            .collect()
    }

    pub fn range(&mut self, lo: i32, hi: i32) -> i32 {
        lo + (self.next_u32() % (hi - lo + 1) as u32) as i32
    }
}

/// Random convolution problem with scales chosen so outputs spread over the
/// u8 range instead of clamping.
pub struct ConvFixture {
    pub param: ConvParam,
    pub src: Vec<u8>,
    pub weight: Vec<i8>,
    pub weight_scale: Vec<f32>,
    pub bias: Vec<i32>,
    pub activation_params: Vec<f32>,
    pub io: IoQuant,
}

impl ConvFixture {
    /// Full-range weights; `overflow_safe` limits them to `[-64, 63]`.
    pub fn new(param: ConvParam, seed: u32, overflow_safe: bool) -> Self {
        let mut rng = Lcg::new(seed);
        let src = rng.bytes(param.src_size());
        let weight = if overflow_safe {
            rng.weights(param.weight_size(), -64, 63)
        } else {
            rng.weights(param.weight_size(), -128, 127)
        };
        let k = param.contraction() as f32;
        let weight_scale = (0..param.dst_c)
            .map(|c| (1.0 + 0.1 * (c % 3) as f32) / (64.0 * k.sqrt()))
            .collect();
        let bias = (0..param.dst_c).map(|_| rng.range(-500, 500)).collect();
        let activation_params = match param.activation {
            ActivationKind::Prelu => (0..param.dst_c).map(|c| 0.05 * (c % 4) as f32).collect(),
            _ => Vec::new(),
        };
        let io = IoQuant::new(
            Quant::new(0.02, rng.range(100, 150) as u8),
            Quant::new(0.015, 128),
        );
        Self {
            param,
            src,
            weight,
            weight_scale,
            bias,
            activation_params,
            io,
        }
    }

    pub fn weights(&self) -> ConvWeights<'_> {
        ConvWeights::new(&self.weight, &self.weight_scale)
            .with_bias(&self.bias)
            .with_activation_params(&self.activation_params)
    }

    pub fn build(&self, options: &ConvOptions) -> QuantizedConvolution {
        QuantizedConvolution::new(self.param.clone(), self.io, self.weights(), options)
            .unwrap_or_else(|e| panic!("{}: {e}", self.param))
    }

    pub fn run(&self, conv: &QuantizedConvolution) -> Vec<u8> {
        let mut dst = vec![0u8; self.param.dst_size()];
        let mut buf = vec![0u8; conv.external_buffer_size()];
        conv.forward(&self.src, Some(&mut buf), &mut dst);
        dst
    }

    /// Integer reference with the arithmetic of `conv`'s variant.
    pub fn reference(&self, conv: &QuantizedConvolution) -> Vec<u8> {
        let mut dst = vec![0u8; self.param.dst_size()];
        let mode = conv.variant().accumulation();
        conv_reference(&self.param, &self.src, &self.weight, conv.context(), mode, &mut dst);
        dst
    }
}

/// Index and values of the first mismatch, for readable failures.
pub fn first_mismatch(a: &[u8], b: &[u8]) -> Option<(usize, u8, u8)> {
    a.iter()
        .zip(b)
        .enumerate()
        .find(|(_, (x, y))| x != y)
        .map(|(i, (&x, &y))| (i, x, y))
}

pub fn assert_same(got: &[u8], want: &[u8], name: &str) {
    assert_eq!(got.len(), want.len(), "{name}: length mismatch");
    if let Some((i, x, y)) = first_mismatch(got, want) {
        panic!("{name}: first mismatch at {i}: got {x}, expected {y}");
    }
}
