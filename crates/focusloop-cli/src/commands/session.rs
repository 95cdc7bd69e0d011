use std::io::{BufRead, Write};
use std::sync::Arc;

use clap::Args;
use focusloop_core::sampler::SamplerSettings;
use focusloop_core::session::{AbandonPolicy, HaltReason};
use focusloop_core::storage::display_time;
use focusloop_core::{
    ActivityMonitor, ActivitySampler, Category, Event, NullMonitor, Outcome, Plan, Scheduler,
    SchedulerSnapshot, SessionHandle, SessionRunner, TaskSpec,
};
use tokio::sync::mpsc;

use super::Context;

#[derive(Args)]
pub struct RunArgs {
    /// Task description; repeat for several tasks (worked in order)
    #[arg(long = "task", required = true)]
    pub tasks: Vec<String>,
    /// Category for every task instead of classifying
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub study_min: Option<u64>,
    #[arg(long)]
    pub short_break_min: Option<u64>,
    #[arg(long)]
    pub long_break_min: Option<u64>,
    /// Study cycles before a long break
    #[arg(long)]
    pub cycles: Option<u32>,
    /// Size each study phase from history
    #[arg(long)]
    pub adaptive: bool,
    /// Move on to the next task when one is not completed
    #[arg(long)]
    pub skip_abandoned: bool,
    /// Disable screen sampling
    #[arg(long)]
    pub no_sampling: bool,
    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

enum Start {
    Fresh(Plan),
    Resume(SchedulerSnapshot),
}

pub fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;

    let mut settings = ctx.config.plan_settings();
    if let Some(m) = args.study_min {
        settings.study_seconds = m * 60;
    }
    if let Some(m) = args.short_break_min {
        settings.short_break_seconds = m * 60;
    }
    if let Some(m) = args.long_break_min {
        settings.long_break_seconds = m * 60;
    }
    if let Some(c) = args.cycles {
        settings.cycles_before_long_break = c;
    }
    if args.adaptive {
        settings.adaptive_timing = true;
    }
    if args.skip_abandoned {
        settings.abandon_policy = AbandonPolicy::SkipToNext;
    }

    let category = match args.category.as_deref() {
        Some(name) => Some(
            Category::parse(name).ok_or_else(|| format!("unknown category '{name}'"))?,
        ),
        None => None,
    };
    let tasks = args
        .tasks
        .into_iter()
        .map(|desc| {
            let spec = TaskSpec::new(desc);
            match category {
                Some(c) => spec.with_category(c),
                None => spec,
            }
        })
        .collect();

    drive(ctx, Start::Fresh(Plan::new(tasks, settings)), args.no_sampling, args.json)
}

pub fn resume(no_sampling: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    let Some(saved) = ctx.store.load_resume_state()? else {
        return Err("nothing to resume".into());
    };
    let snapshot: SchedulerSnapshot = serde_json::from_str(&saved)?;
    drive(ctx, Start::Resume(snapshot), no_sampling, json)
}

fn monitor(ctx: &Context, runtime: &tokio::runtime::Runtime, no_sampling: bool) -> Box<dyn ActivityMonitor> {
    let sampler = &ctx.config.sampler;
    if no_sampling || !sampler.enabled {
        return Box::new(NullMonitor::default());
    }
    let source = match sampler.screen_source() {
        Some(Ok(source)) => source,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "screen source misconfigured; sampling off");
            return Box::new(NullMonitor::default());
        }
        None => {
            tracing::info!("no capture/ocr commands configured; sampling off");
            return Box::new(NullMonitor::default());
        }
    };
    let lexicon = match sampler.lexicon() {
        Ok(lexicon) => lexicon,
        Err(e) => {
            tracing::warn!(error = %e, "lexicon unreadable; sampling off");
            return Box::new(NullMonitor::default());
        }
    };
    Box::new(ActivitySampler::new(
        runtime.handle().clone(),
        Arc::new(source),
        lexicon,
        SamplerSettings::from(sampler),
    ))
}

fn drive(ctx: Context, start: Start, no_sampling: bool, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let monitor = monitor(&ctx, &runtime, no_sampling);
    let scheduler = Scheduler::new(
        ctx.store.clone(),
        ctx.estimator.clone(),
        ctx.classifier,
        monitor,
    );

    runtime.block_on(async move {
        let (handle, mut events, join) = SessionRunner::spawn(scheduler);
        match start {
            Start::Fresh(plan) => handle.start(plan).await?,
            Start::Resume(snapshot) => handle.restore(snapshot).await?,
        }
        let mut input = stdin_lines();
        let mut stdin_open = true;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        if !json {
            eprintln!("commands: c=completed  n=not completed  e=extend  s <task-id>=switch  q=cancel");
        }

        let finished = loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break false };
                    let done = matches!(event, Event::PlanCompleted { .. } | Event::PlanHalted { .. });
                    render(&event, json)?;
                    if done {
                        break true;
                    }
                }
                line = input.recv(), if stdin_open => {
                    let Some(line) = line else {
                        stdin_open = false;
                        continue;
                    };
                    if let Err(e) = dispatch(&handle, line.trim()).await {
                        eprintln!("error: {e}");
                    }
                }
                _ = &mut ctrl_c => {
                    break false;
                }
            }
        };

        if finished {
            ctx.store.clear_resume_state()?;
            match ctx.estimator.refine_from_store(ctx.store.as_ref()) {
                Ok(outcome) => tracing::debug!(?outcome, "post-plan refine"),
                Err(e) => tracing::warn!(error = %e, "post-plan refine failed"),
            }
        } else {
            let snapshot = handle.snapshot().await?;
            ctx.store.save_resume_state(&serde_json::to_string(&snapshot)?)?;
            eprintln!("\ninterrupted; continue with `focusloop resume`");
        }
        handle.shutdown().await;
        join.await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Forward stdin lines from a plain thread; tokio stdin would need extra features.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn dispatch(handle: &SessionHandle, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (None, _) => {}
        (Some("c"), _) => handle.supply_outcome(Outcome::Completed).await?,
        (Some("n"), _) => handle.supply_outcome(Outcome::NotCompleted).await?,
        (Some("e"), _) => handle.supply_outcome(Outcome::ExtendTime).await?,
        (Some("s"), Some(task_id)) => handle.switch_task(task_id).await?,
        (Some("q"), _) => handle.cancel().await?,
        (Some(other), _) => return Err(format!("unrecognized input '{other}'").into()),
    }
    Ok(())
}

fn render(event: &Event, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let mut out = std::io::stdout().lock();
    match event {
        Event::Tick { remaining_secs, phase } => {
            write!(out, "\r{:<12} {:>8}", phase.as_str(), display_time(*remaining_secs))?;
            out.flush()?;
        }
        Event::PlanStarted { plan_id, task_count, .. } => {
            writeln!(out, "plan {plan_id} started with {task_count} task(s)")?;
        }
        Event::DurationRecommended { task_id, seconds, basis, .. } => {
            writeln!(out, "{task_id}: recommended {} ({basis:?})", display_time(*seconds))?;
        }
        Event::PhaseStarted { phase, task_id, duration_secs, cycle, .. } => {
            writeln!(
                out,
                "\n{} for {task_id} ({}), cycle {cycle}",
                phase.as_str(),
                display_time(*duration_secs)
            )?;
        }
        Event::PhaseEnded { phase, .. } => writeln!(out, "\n{} ended", phase.as_str())?,
        Event::OutcomeRequested { task_id, .. } => {
            writeln!(out, "time is up for {task_id}: [c]ompleted, [n]ot completed, [e]xtend?")?;
        }
        Event::TimeExtended { added_secs, .. } => {
            writeln!(out, "extended by {}", display_time(*added_secs))?;
        }
        Event::TaskSwitched { from_task, to_task, discarded_secs, .. } => {
            writeln!(
                out,
                "\nswitched {from_task} -> {to_task} ({} discarded)",
                display_time(*discarded_secs)
            )?;
        }
        Event::TaskEnded { task_id, completed, .. } => {
            let verdict = if *completed { "completed" } else { "not completed" };
            writeln!(out, "{task_id} {verdict}")?;
        }
        Event::PlanHalted { plan_id, reason, .. } => {
            let why = match reason {
                HaltReason::TaskAbandoned => "a task was not completed",
                HaltReason::Cancelled => "cancelled",
            };
            writeln!(out, "\nplan {plan_id} halted: {why}")?;
        }
        Event::PlanCompleted { report, .. } => {
            writeln!(out)?;
            write!(out, "{}", report.render())?;
        }
        Event::SamplerWarning { reason, .. } => eprintln!("\nwarning: {reason}"),
        Event::PersistenceFailed { message, .. } => eprintln!("\nwarning: record not saved: {message}"),
    }
    Ok(())
}
