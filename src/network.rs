use crate::consts::{
    BN_EPSILON, BN_MOMENTUM, CHANNELS, DROPOUT_RATE, DROPOUT_STAGES, INIT_STD, LEAKY_SLOPE,
};
use crate::error::{Pix2PixError, Pix2PixResult};
use burn::{
    config::Config,
    module::Module,
    nn::{
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    tensor::{
        Tensor,
        activation::{leaky_relu, tanh},
        backend::Backend,
    },
};

fn normal_init() -> Initializer {
    Initializer::Normal {
        mean: 0.0,
        std: INIT_STD,
    }
}

fn batch_norm<B: Backend>(channels: usize, device: &B::Device) -> BatchNorm<B> {
    BatchNormConfig::new(channels)
        .with_epsilon(BN_EPSILON)
        .with_momentum(BN_MOMENTUM)
        .init(device)
}

/// Padding that halves (or, transposed, doubles) the resolution at stride 2.
fn same_padding(kernel_size: usize) -> usize {
    kernel_size.saturating_sub(2) / 2
}

#[derive(Module, Debug)]
pub struct DownSample<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B>>,
}

impl<B: Backend> DownSample<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        apply_batchnorm: bool,
        device: &B::Device,
    ) -> Self {
        let pad = same_padding(kernel_size);
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .with_initializer(normal_init())
            .init(device);
        let norm = apply_batchnorm.then(|| batch_norm(out_channels, device));

        Self { conv, norm }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        leaky_relu(x, LEAKY_SLOPE)
    }
}

#[derive(Module, Debug)]
pub struct UpSample<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: BatchNorm<B>,
    dropout: Option<Dropout>,
}

impl<B: Backend> UpSample<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        apply_dropout: bool,
        device: &B::Device,
    ) -> Self {
        let pad = same_padding(kernel_size);
        let conv =
            ConvTranspose2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_stride([2, 2])
                .with_padding([pad, pad])
                .with_bias(false)
                .with_initializer(normal_init())
                .init(device);
        let norm = batch_norm(out_channels, device);
        let dropout = apply_dropout.then(|| DropoutConfig::new(DROPOUT_RATE).init());

        Self {
            conv,
            norm,
            dropout,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(input);
        let x = self.norm.forward(x);
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        leaky_relu(x, LEAKY_SLOPE)
    }
}

/// U-Net generator: every downsampling output except the bottleneck is
/// concatenated onto the decoder stage of the same resolution.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    pub down: Vec<DownSample<B>>,
    pub up: Vec<UpSample<B>>,
    pub last: ConvTranspose2d<B>,
    pub skip_connections: bool,
}

impl<B: Backend> Generator<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        let mut skips = Vec::with_capacity(self.down.len());

        for stage in &self.down {
            x = stage.forward(x);
            skips.push(x.clone());
        }
        skips.pop();

        for stage in &self.up {
            x = stage.forward(x);
            if self.skip_connections
                && let Some(skip) = skips.pop()
            {
                x = Tensor::cat(vec![x, skip], 1);
            }
        }

        tanh(self.last.forward(x))
    }

    /// Inputs must be divisible by this along both spatial axes.
    pub fn size_divisor(&self) -> usize {
        1 << self.down.len()
    }
}

/// PatchGAN: scores every receptive-field patch of the (input, candidate)
/// pair instead of the whole image.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    pub down: Vec<DownSample<B>>,
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
    pub last: Conv2d<B>,
}

impl<B: Backend> Discriminator<B> {
    pub fn forward(&self, input: Tensor<B, 4>, candidate: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = Tensor::cat(vec![input, candidate], 1);

        for stage in &self.down {
            x = stage.forward(x);
        }

        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = leaky_relu(x, LEAKY_SLOPE);
        self.last.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct NetworkConfig {
    #[config(default = "vec![64, 128, 256, 512, 512, 512, 512, 512]")]
    pub generator_channels: Vec<usize>,
    #[config(default = "vec![64, 128, 256]")]
    pub discriminator_channels: Vec<usize>,
    #[config(default = 512)]
    pub discriminator_hidden: usize,
    #[config(default = 4)]
    pub kernel_size: usize,
    #[config(default = "CHANNELS")]
    pub input_channels: usize,
    #[config(default = "CHANNELS")]
    pub output_channels: usize,
    #[config(default = true)]
    pub use_initializer: bool,
    #[config(default = true)]
    pub skip_connections: bool,
}

impl NetworkConfig {
    pub fn validate(&self) -> Pix2PixResult<()> {
        if self.generator_channels.is_empty() || self.discriminator_channels.is_empty() {
            return Err(Pix2PixError::InvalidConfig(
                "channel lists must not be empty".into(),
            ));
        }
        if self.kernel_size < 2 || self.kernel_size % 2 != 0 {
            return Err(Pix2PixError::InvalidConfig(format!(
                "kernel_size must be even and at least 2, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> (Generator<B>, Discriminator<B>) {
        (self.init_generator(device), self.init_discriminator(device))
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let k = self.kernel_size;
        let channels = &self.generator_channels;

        let mut prev = self.input_channels;
        let down: Vec<DownSample<B>> = channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let stage = DownSample::new(prev, c, k, i > 0, device);
                prev = c;
                stage
            })
            .collect();

        let decoder = &channels[..channels.len().saturating_sub(1)];
        let up: Vec<UpSample<B>> = decoder
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &c)| {
                let stage = UpSample::new(prev, c, k, i < DROPOUT_STAGES, device);
                prev = if self.skip_connections { c * 2 } else { c };
                stage
            })
            .collect();

        let initializer = if self.use_initializer {
            normal_init()
        } else {
            Initializer::XavierUniform { gain: 1.0 }
        };
        let pad = same_padding(k);
        let last = ConvTranspose2dConfig::new([prev, self.output_channels], [k, k])
            .with_stride([2, 2])
            .with_padding([pad, pad])
            .with_initializer(initializer)
            .init(device);

        Generator {
            down,
            up,
            last,
            skip_connections: self.skip_connections,
        }
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let k = self.kernel_size;

        let mut prev = self.input_channels + self.output_channels;
        let down: Vec<DownSample<B>> = self
            .discriminator_channels
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let stage = DownSample::new(prev, c, k, i > 0, device);
                prev = c;
                stage
            })
            .collect();

        let hidden = self.discriminator_hidden;
        let conv = Conv2dConfig::new([prev, hidden], [k, k])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(normal_init())
            .init(device);
        let norm = batch_norm(hidden, device);
        let last = Conv2dConfig::new([hidden, 1], [k, k])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_initializer(normal_init())
            .init(device);

        Discriminator {
            down,
            conv,
            norm,
            last,
        }
    }
}
