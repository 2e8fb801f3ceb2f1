//! Bee Research - 行式交互入口
//!
//! 每行输入开始一轮研究；空行忽略，exit / quit 退出。
//! 本轮暂停在报告生成之前时提示一次，非空输入作为反馈继续本轮。
//! Ctrl-C 在轮次进行中取消当前轮次，在等待输入时结束输入。

use std::future::Future;
use std::path::PathBuf;

use anyhow::Context;
use bee_research::{build_components, config::load_config, observability, Scheduler, TurnOutcome};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio_util::sync::CancellationToken;

type InputLines = Lines<BufReader<Stdin>>;

/// 等待一行输入；interrupt 先完成时视为输入结束
async fn read_or_interrupt<R, I>(read: R, interrupt: I) -> anyhow::Result<Option<String>>
where
    R: Future<Output = std::io::Result<Option<String>>>,
    I: Future,
{
    tokio::select! {
        line = read => Ok(line?),
        _ = interrupt => Ok(None),
    }
}

/// 输出提示并读一行；等待输入时 Ctrl-C 等同于 EOF
async fn prompt(lines: &mut InputLines, label: &str) -> anyhow::Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(label.as_bytes()).await?;
    stdout.flush().await?;
    read_or_interrupt(lines.next_line(), tokio::signal::ctrl_c()).await
}

/// 跑一轮（或继续一轮），期间 Ctrl-C 触发取消
async fn with_interrupt<F, Fut>(run: F) -> anyhow::Result<TurnOutcome>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<TurnOutcome, bee_research::core::AgentError>>,
{
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = run(cancel).await;
    watcher.abort();
    Ok(outcome?)
}

async fn handle_turn(
    scheduler: &Scheduler,
    thread_id: &str,
    input: &str,
    lines: &mut InputLines,
) -> anyhow::Result<()> {
    let mut outcome = with_interrupt(move |cancel| scheduler.run_turn(thread_id, input, cancel))
        .await
        .context("Turn failed to start")?;

    if let TurnOutcome::Paused { .. } = outcome {
        let feedback = prompt(lines, "Draft ready. Approve or provide feedback: ").await?;
        match feedback.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(feedback) => {
                let feedback = feedback.as_str();
                outcome = with_interrupt(move |cancel| scheduler.resume(thread_id, feedback, cancel))
                    .await
                    .context("Resume failed")?;
            }
            None => println!("Turn left paused."),
        }
    }

    match outcome {
        TurnOutcome::Completed { report } => println!("\n{}", report),
        TurnOutcome::Paused { next_stage } => println!("Paused before {}.", next_stage),
        TurnOutcome::Failed { error } => eprintln!("Research failed: {}", error),
        TurnOutcome::Cancelled => println!("Cancelled."),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let components = build_components(&cfg).context("Failed to build components")?;
    let thread_id = cfg.app.thread_id.clone();
    tracing::info!(thread_id = %thread_id, "Bee Research ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = prompt(&mut lines, "\nUser> ").await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "exit" | "quit") {
            break;
        }
        if let Err(e) = handle_turn(&components.scheduler, &thread_id, input, &mut lines).await {
            eprintln!("Error: {:#}", e);
        }
    }

    Ok(())
}
