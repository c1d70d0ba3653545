use std::path::Path;
use std::sync::Arc;

use easel_core::{get_image_generator, Config, GenerationRequest};

fn mock_config(output_dir: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.system.cpu_only = true;
    config.system.output_dir = output_dir.to_path_buf();
    // Keep test images tiny.
    config.image.height = 32;
    config.image.width = 32;
    Arc::new(config)
}

fn request_with_seed(prompt: &str, seed: u64) -> GenerationRequest {
    GenerationRequest {
        seed: Some(seed),
        ..GenerationRequest::new(prompt)
    }
}

#[tokio::test]
async fn generates_image_and_reports_resolved_fields() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    let result = generator
        .generate(request_with_seed("A red cube", 42))
        .await
        .unwrap();

    assert_eq!(result.model, "mock");
    assert_eq!(result.prompt, "A red cube");
    assert_eq!(result.seed, 42);
    assert!(result.image_path.exists(), "{:?}", result.image_path);
    assert_eq!(result.metadata["height"], 32);
    assert_eq!(result.metadata["width"], 32);
}

#[tokio::test]
async fn omitted_seed_is_drawn_below_2_pow_32() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    let result = generator
        .generate(GenerationRequest::new("unseeded"))
        .await
        .unwrap();
    assert!(result.seed < (1u64 << 32));
}

#[tokio::test]
async fn prompt_sidecar_holds_the_exact_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    let prompt = "castle at dusk, oil painting";
    let result = generator
        .generate(request_with_seed(prompt, 7))
        .await
        .unwrap();
    let sidecar = result.image_path.with_extension("txt");
    assert_eq!(std::fs::read_to_string(sidecar).unwrap(), prompt);
}

#[tokio::test]
async fn same_seed_produces_identical_files() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let generator_a = get_image_generator(mock_config(dir_a.path()), true).unwrap();
    let generator_b = get_image_generator(mock_config(dir_b.path()), true).unwrap();

    let a = generator_a
        .generate(request_with_seed("same scene", 1234))
        .await
        .unwrap();
    let b = generator_b
        .generate(request_with_seed("same scene", 1234))
        .await
        .unwrap();

    let bytes_a = std::fs::read(&a.image_path).unwrap();
    let bytes_b = std::fs::read(&b.image_path).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[tokio::test]
async fn unsupported_negative_prompt_is_ignored_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    let request = GenerationRequest {
        negative_prompt: Some("blurry, low quality".into()),
        ..request_with_seed("a lighthouse", 5)
    };
    let result = generator.generate(request).await.unwrap();
    assert_eq!(result.prompt, "a lighthouse");
}

#[tokio::test]
async fn lifecycle_lazy_loads_and_reloads_after_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    // cleanup on a never-loaded generator is a no-op
    generator.cleanup();
    assert!(!generator.is_loaded());

    generator
        .generate(request_with_seed("first", 1))
        .await
        .unwrap();
    assert!(generator.is_loaded());

    generator.cleanup();
    assert!(!generator.is_loaded());

    // generate after cleanup lazy-loads again
    generator
        .generate(request_with_seed("second", 2))
        .await
        .unwrap();
    assert!(generator.is_loaded());
}

#[tokio::test]
async fn request_parameters_override_config_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let generator = get_image_generator(mock_config(dir.path()), true).unwrap();

    let request = GenerationRequest {
        height: Some(16),
        width: Some(24),
        num_inference_steps: Some(2),
        ..request_with_seed("sized", 9)
    };
    let result = generator.generate(request).await.unwrap();
    assert_eq!(result.metadata["height"], 16);
    assert_eq!(result.metadata["width"], 24);
    assert_eq!(result.steps, 2);

    let image = image::open(&result.image_path).unwrap();
    assert_eq!(image.width(), 24);
    assert_eq!(image.height(), 16);
}
