use crate::kernels::params::ActivationKind;
/// `activate(x, params, channel)`; `params` holds the shared parameters or,
/// for parametric relu, one slope per channel.
pub type ActivationFn = fn(f32, &[f32], usize) -> f32;
pub fn select(kind: ActivationKind) -> ActivationFn {
    match kind {
        ActivationKind::Identity => identity,
        ActivationKind::Relu => relu,
        ActivationKind::LeakyRelu => leaky_relu,
        ActivationKind::RestrictRange => restrict_range,
        ActivationKind::Prelu => prelu,
        ActivationKind::Elu => elu,
        ActivationKind::Hswish => hswish,
        ActivationKind::Mish => mish,
        ActivationKind::HardSigmoid => hard_sigmoid,
        ActivationKind::Swish => swish,
        ActivationKind::Gelu => gelu,
    }
}
pub fn activate(kind: ActivationKind, x: f32, params: &[f32], c: usize) -> f32 {
    select(kind)(x, params, c)
}
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
fn identity(x: f32, _: &[f32], _: usize) -> f32 {
    x
}
fn relu(x: f32, _: &[f32], _: usize) -> f32 {
    x.max(0.0)
}
fn leaky_relu(x: f32, p: &[f32], _: usize) -> f32 {
    x.max(0.0) + p[0] * x.min(0.0)
}
fn restrict_range(x: f32, p: &[f32], _: usize) -> f32 {
    x.max(p[0]).min(p[1])
}
fn prelu(x: f32, p: &[f32], c: usize) -> f32 {
    x.max(0.0) + p[c] * x.min(0.0)
}
fn elu(x: f32, p: &[f32], _: usize) -> f32 {
    if x >= 0.0 {
        x
    } else {
        p[0] * (x.exp() - 1.0)
    }
}
fn hswish(x: f32, p: &[f32], _: usize) -> f32 {
    (x.min(p[0]) + p[0]).max(0.0) * p[1] * x
}
fn mish(x: f32, p: &[f32], _: usize) -> f32 {
    if x > p[0] {
        x
    } else {
        x * x.exp().ln_1p().tanh()
    }
}
fn hard_sigmoid(x: f32, p: &[f32], _: usize) -> f32 {
    (x * p[0] + p[1]).clamp(0.0, 1.0)
}
fn swish(x: f32, p: &[f32], _: usize) -> f32 {
    x * sigmoid(p[0] * x)
}
fn gelu(x: f32, _: &[f32], _: usize) -> f32 {
    x * 0.5 * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
}
