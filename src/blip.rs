//! BLIP image captioning on candle.

use crate::{
    captioner::CaptionBackend,
    error::CaptionError,
    input::{RgbImage, to_rgb_buffer},
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::{
    generation::LogitsProcessor,
    models::{blip, blip_text},
};
use hf_hub::{Repo, RepoType, api::sync::Api};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

/// Hub repository of the default captioning model.
pub const DEFAULT_MODEL_ID: &str = "Salesforce/blip-image-captioning-base";

/// Side length the vision encoder expects.
pub const IMAGE_SIZE: usize = 384;

const IMAGE_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
const IMAGE_STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;

const WEIGHTS_FILE: &str = "model.safetensors";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Architecture of `blip-image-captioning-base`.
pub fn base_config() -> blip::Config {
    let text_config = blip_text::Config {
        vocab_size: 30524,
        hidden_size: 768,
        encoder_hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 768,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        max_position_embeddings: 512,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-12,
        is_decoder: true,
    };
    let vision_config = blip::VisionConfig {
        hidden_size: 768,
        intermediate_size: 3072,
        projection_dim: 512,
        num_hidden_layers: 12,
        num_attention_heads: 12,
        image_size: IMAGE_SIZE,
        patch_size: 16,
        hidden_act: candle_nn::Activation::Gelu,
        layer_norm_eps: 1e-5,
    };

    blip::Config {
        text_config,
        vision_config,
        projection_dim: 512,
        image_text_hidden_size: 256,
    }
}

/// Local paths of the files a [`Blip`] model is built from.
#[derive(Debug, Clone)]
pub struct BlipFiles {
    /// Safetensors weights.
    pub weights: PathBuf,
    /// `tokenizer.json` of the paired processor.
    pub tokenizer: PathBuf,
}

impl BlipFiles {
    /// Fetches the files from the hub, reusing the local cache when present.
    pub fn from_hub(model_id: &str, revision: &str) -> Result<Self, CaptionError> {
        log::info!("Fetching {model_id}@{revision} from the hub");
        let api = Api::new().map_err(hub_error)?;
        let repo = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        ));
        Ok(Self {
            weights: repo.get(WEIGHTS_FILE).map_err(hub_error)?,
            tokenizer: repo.get(TOKENIZER_FILE).map_err(hub_error)?,
        })
    }

    /// All files, for snapshotting.
    pub fn paths(&self) -> [&Path; 2] {
        [self.weights.as_path(), self.tokenizer.as_path()]
    }
}

fn hub_error(e: hf_hub::api::sync::ApiError) -> CaptionError {
    CaptionError::Hub(e.to_string())
}

/// Picks the compute device: GPU when compiled in and present, else CPU.
pub fn select_device(force_cpu: bool) -> Result<Device, CaptionError> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        return Ok(Device::new_cuda(0)?);
    }
    if candle_core::utils::metal_is_available() {
        return Ok(Device::new_metal(0)?);
    }
    Ok(Device::Cpu)
}

/// Turns an RGB image into the normalised `(3, 384, 384)` tensor the vision
/// encoder takes.
pub fn preprocess(image: &RgbImage, device: &Device) -> Result<Tensor, CaptionError> {
    let resized = image::imageops::resize(
        &to_rgb_buffer(image)?,
        IMAGE_SIZE as u32,
        IMAGE_SIZE as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let data = Tensor::from_vec(resized.into_raw(), (IMAGE_SIZE, IMAGE_SIZE, 3), &Device::Cpu)?
        .permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGE_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGE_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let normalised = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(normalised.to_device(device)?)
}

/// BLIP captioning model with its tokenizer, decoding greedily.
pub struct Blip {
    model: blip::BlipForConditionalGeneration,
    tokenizer: Tokenizer,
    logits_processor: LogitsProcessor,
    device: Device,
    max_tokens: usize,
}

impl Blip {
    /// Loads weights and tokenizer.
    ///
    /// `max_tokens` bounds the whole token sequence, BOS included, so at most
    /// `max_tokens - 1` tokens are generated.
    pub fn load(files: &BlipFiles, device: Device, max_tokens: usize) -> Result<Self, CaptionError> {
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;

        log::info!("Loading weights from {}", files.weights.display());
        // SAFETY: the weights file is not modified while it is mapped.
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.weights], DType::F32, &device)?
        };
        let model = blip::BlipForConditionalGeneration::new(&base_config(), vb)?;

        Ok(Self {
            model,
            tokenizer,
            // no temperature: argmax decoding
            logits_processor: LogitsProcessor::new(1337, None, None),
            device,
            max_tokens,
        })
    }

    /// Generates a caption for one image.
    pub fn caption(&mut self, image: &RgbImage) -> Result<String, CaptionError> {
        let pixels = preprocess(image, &self.device)?;
        let image_embeds = pixels.unsqueeze(0)?.apply(self.model.vision_model())?;

        self.model.text_decoder().reset_kv_cache();

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..generation_steps(self.max_tokens) {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .model
                .text_decoder()
                .forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = self.logits_processor.sample(&logits)?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }
        log::debug!("Generated {} tokens", token_ids.len() - 1);

        let text = self
            .tokenizer
            .decode(&token_ids, true)
            .map_err(|e| CaptionError::Tokenizer(e.to_string()))?;
        Ok(text.trim().to_string())
    }
}

// The sequence limit counts the BOS token that seeds decoding.
fn generation_steps(max_tokens: usize) -> usize {
    max_tokens.saturating_sub(1)
}

impl CaptionBackend for Blip {
    fn generate(&mut self, image: &RgbImage) -> Result<String, CaptionError> {
        self.caption(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{ImageInput, decode_image};

    fn solid(width: usize, height: usize, value: u8) -> RgbImage {
        decode_image(ImageInput::Pixels {
            width,
            height,
            data: vec![value; width * height * 3],
        })
        .unwrap()
    }

    #[test]
    fn preprocess_yields_chw_at_encoder_size() {
        let tensor = preprocess(&solid(224, 224, 0), &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[3, IMAGE_SIZE, IMAGE_SIZE]);
        assert_eq!(tensor.dtype(), DType::F32);
    }

    #[test]
    fn preprocess_normalises_per_channel() {
        let tensor = preprocess(&solid(10, 7, 255), &Device::Cpu).unwrap();
        let corner: Vec<f32> = (0..3)
            .map(|c| tensor.get(c).unwrap().get(0).unwrap().get(0).unwrap().to_scalar().unwrap())
            .collect();
        for (c, value) in corner.into_iter().enumerate() {
            let expected = (1.0 - IMAGE_MEAN[c]) / IMAGE_STD[c];
            assert!((value - expected).abs() < 1e-4, "channel {c}: {value} vs {expected}");
        }
    }

    #[test]
    fn base_config_matches_checkpoint() {
        let config = base_config();
        assert_eq!(config.text_config.vocab_size, 30524);
        assert_eq!(config.vision_config.image_size, IMAGE_SIZE);
        assert!((BOS_TOKEN_ID as usize) < config.text_config.vocab_size);
    }

    #[test]
    fn token_limit_includes_bos() {
        assert_eq!(generation_steps(20), 19);
        assert_eq!(generation_steps(1), 0);
        assert_eq!(generation_steps(0), 0);
    }

    #[test]
    fn cpu_is_honoured() {
        assert!(matches!(select_device(true).unwrap(), Device::Cpu));
    }
}
