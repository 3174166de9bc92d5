use anyhow::{bail, Context};
use speech_processor_lib::services::config_store::ConfigStore;
use speech_processor_lib::services::providers::ProviderSet;
use speech_processor_lib::{init_logging, PipelineCoordinator, PipelineError};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn preview(s: &str, max_chars: usize) -> String {
    let mut out: String = s.chars().take(max_chars).collect();
    if s.chars().count() > max_chars {
        out.push_str("...");
    }
    out.replace('\n', " ")
}

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

/// First positional argument, skipping flags and the values they take.
fn input_path(args: &[String]) -> Option<String> {
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "--out" => i += 2,
            "--set-key" => i += 3,
            a if a.starts_with("--") => i += 1,
            a => return Some(a.to_string()),
        }
    }
    None
}

fn open_store(config_path: Option<String>) -> anyhow::Result<ConfigStore> {
    match config_path {
        Some(p) => Ok(ConfigStore::from_file(PathBuf::from(p))),
        None => {
            let dir = ConfigStore::default_config_dir()
                .context("no config directory available; pass --config <path>")?;
            Ok(ConfigStore::new(dir))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage:\n  process_text <file.txt> [--config <config.json>] [--out <json_path>] [--no-history]\n  process_text --set-key <provider> <api_key> [--config <config.json>]\n\nNotes:\n  - 环境变量 MAX_TOKENS / CHUNK_SIZE / MAX_RETRIES 等覆盖配置文件中的流水线参数。\n  - API Key 优先读取 OPENAI_API_KEY / DEEPSEEK_API_KEY。\n  - Ctrl+C 会取消所有进行中的请求，且不写入历史记录。"
        );
        return Ok(());
    }

    init_logging();
    let store = open_store(parse_arg_value(&args, "--config"))?;

    if let Some(provider) = parse_arg_value(&args, "--set-key") {
        let key = args
            .iter()
            .position(|a| a == "--set-key")
            .and_then(|i| args.get(i + 2))
            .context("--set-key needs <provider> <api_key>")?;
        store.ensure_dir()?;
        store.set_api_key(&provider, key)?;
        println!("Saved API key for {} to {}", provider, store.config_file().display());
        return Ok(());
    }

    let path = input_path(&args).context("missing input file")?;
    let out_path = parse_arg_value(&args, "--out");
    let no_history = has_flag(&args, "--no-history");

    let config = store
        .load_effective()
        .with_context(|| format!("load config {}", store.config_file().display()))?;
    let providers = ProviderSet::from_config(&config).context("configure providers")?;
    let mut pipeline = PipelineCoordinator::from_app_config(&config, providers)?;
    if no_history {
        pipeline = pipeline.without_history();
    }

    let bytes = std::fs::read(&path).with_context(|| format!("read file {}", path))?;
    println!("File: {}", path);
    println!("Size: {} bytes", bytes.len());
    println!("Classifier: {}", config.roles.classifier);
    println!(
        "Fallback: {}",
        config
            .roles
            .fallback_classifier
            .clone()
            .unwrap_or_else(|| "(none)".to_string())
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let result = match pipeline.process_with_cancel_bytes(&bytes, cancel).await {
        Ok(r) => r,
        Err(PipelineError::Cancelled) => bail!("cancelled"),
        Err(e) => return Err(e.into()),
    };

    println!("\nSegments ({}):", result.segments.len());
    for (i, seg) in result.segments.iter().enumerate() {
        println!(
            "#{} [{} {:.1}] {}",
            i + 1,
            seg.emotion.emotion,
            seg.emotion.score,
            preview(&seg.text, 80)
        );
        if !seg.biblical_references.is_empty() {
            println!("    经文: {}", seg.biblical_references.join(", "));
        }
        for change in &seg.changes {
            println!("    修改: {}", change);
        }
        for note in &seg.notes {
            println!("    注意: {}", note);
        }
    }

    println!("\nStatus: {:?}", result.summary.status);
    println!(
        "Tokens: {} (prompt {} / completion {}), calls {} ({} failed)",
        result.usage.total_tokens,
        result.usage.prompt_tokens,
        result.usage.completion_tokens,
        result.usage.calls,
        result.usage.failed_calls
    );
    println!("Models: {}", result.usage.model_name);
    println!("Cost: ${:.6}", result.usage.cost_estimate);
    if let Some(files) = &result.log_files {
        println!("History: {}", files.processing_log);
    }

    if let Some(out) = out_path {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&out, json).with_context(|| format!("write {}", out))?;
        println!("Wrote: {}", out);
    }

    Ok(())
}
