use std::error::Error;
use std::time::Duration;

use bobbin_core::app::{Engine, EngineBuilder, EngineConfig};
use bobbin_core::domain::{CaseId, DataMap, Participant, WorkItemStatus, into_data_map};
use bobbin_core::impls::StaticResourceDirectory;
use serde_json::json;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const DEMO_SPEC: &str = include_str!("../../../demos/order.json");

/// bobbin-cli [SPEC_JSON] [--config CONFIG_JSON] [--input DATA_JSON]
struct Args {
    spec: Option<String>,
    config: Option<String>,
    input: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        spec: None,
        config: None,
        input: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = Some(it.next().ok_or("--config needs a path")?),
            "--input" => args.input = Some(it.next().ok_or("--input needs a JSON object")?),
            other if other.starts_with("--") => return Err(format!("unknown option {other}")),
            other => args.spec = Some(other.to_string()),
        }
    }
    Ok(args)
}

/// デモ用の参加者
fn directory() -> StaticResourceDirectory {
    StaticResourceDirectory::new([
        Participant::new("alice").with_role("clerk"),
        Participant::new("bob").with_role("warehouse"),
        Participant::new("carol").with_role("manager"),
    ])
}

/// 参加者の代わりに手元のアイテムを順に進める
///
/// Offered -> Allocated -> Started -> Completed。進められるものがなくなったら終わる。
async fn drive(engine: &Engine, case_id: CaseId, approved: bool) -> Result<(), Box<dyn Error>> {
    loop {
        let mut progressed = false;
        for item in engine.work_items_for_case(case_id).await? {
            let outcome = match item.status() {
                WorkItemStatus::Offered => match item.offered_to().iter().next() {
                    Some(participant) => engine.allocate_work_item(item.id, participant).await,
                    None => continue,
                },
                WorkItemStatus::Allocated => engine.start_work_item(item.id).await,
                WorkItemStatus::Started => {
                    let output = into_data_map(json!({ "approved": approved }));
                    engine.complete_work_item(item.id, output).await
                }
                _ => continue,
            };
            match outcome {
                Ok(()) => progressed = true,
                Err(err) => tracing::warn!(work_item = %item.id, error = %err, "step rejected"),
            }
        }
        if !progressed {
            return Ok(());
        }
        // 後続処理（割り当てなど）はエンジン内で完了しているが、ログを読みやすくする
        sleep(Duration::from_millis(10)).await;
    }
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let source = match &args.spec {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEMO_SPEC.to_string(),
    };
    let input: DataMap = match &args.input {
        Some(raw) => into_data_map(serde_json::from_str(raw)?),
        None => into_data_map(json!({ "amount": 250 })),
    };
    let approved = input
        .get("amount")
        .and_then(|v| v.as_f64())
        .is_none_or(|amount| amount <= 1000.0);

    let engine = EngineBuilder::new()
        .config(config)
        .directory(directory())
        .build()?;
    engine.start();

    let spec_id = engine.load_specification(&source).await?;
    engine.activate_specification(&spec_id).await?;
    let case_id = engine.launch_case(&spec_id, input).await?;
    tracing::info!(case = %case_id, specification = %spec_id, "case launched");

    drive(&engine, case_id, approved).await?;

    let view = engine.case_status(case_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    let status = engine.status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    engine.stop();
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err}");
            eprintln!("usage: bobbin-cli [SPEC_JSON] [--config CONFIG_JSON] [--input DATA_JSON]");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(args).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
