use chrono::Local;
use clap::Args;
use focusloop_core::estimator::RefineOutcome;
use focusloop_core::storage::{display_time, HistoryKey, TaskHistory};
use focusloop_core::{Category, Classifier, Config, SessionStore, ValidationError};

use super::Context;

#[derive(Args)]
pub struct HistoryArgs {
    /// Only this category
    #[arg(long, conflicts_with = "task")]
    pub category: Option<String>,
    /// Only this task description
    #[arg(long)]
    pub task: Option<String>,
    #[arg(long)]
    pub json: bool,
}

fn parse_category(name: &str) -> Result<Category, ValidationError> {
    Category::parse(name).ok_or_else(|| ValidationError::InvalidValue {
        field: "category".into(),
        message: format!("unknown category '{name}'"),
    })
}

pub fn classify(description: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_default();
    let category = Classifier::new(config.classifier.scheme).classify(description);
    println!("{category}");
    Ok(())
}

pub fn recommend(description: &str, category: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    let category = match category {
        Some(name) => parse_category(name)?,
        None => ctx.classifier.classify(description),
    };
    let rec = ctx
        .estimator
        .recommend_from_store(ctx.store.as_ref(), description, category)?;
    let out = serde_json::json!({
        "description": description,
        "category": category,
        "seconds": rec.seconds,
        "display": display_time(rec.seconds),
        "basis": rec.basis,
        "samples": rec.samples,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn history_line(key: &HistoryKey, history: &TaskHistory) -> String {
    let label = match key {
        HistoryKey::Category(c) => format!("[{c}]"),
        HistoryKey::Task(desc) => desc.clone(),
    };
    let samples = history.duration_samples();
    let mean = if samples.is_empty() {
        "-".to_string()
    } else {
        display_time(samples.iter().sum::<u64>() / samples.len() as u64)
    };
    let last = history
        .last_completed_at()
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into());
    format!(
        "{label:<40} {:>3}/{:<3} mean {mean:>8}  last {last}",
        history.completions(),
        history.attempts()
    )
}

pub fn history(args: HistoryArgs) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    let entries: Vec<(HistoryKey, TaskHistory)> = match (&args.category, &args.task) {
        (Some(name), _) => {
            let key = HistoryKey::Category(parse_category(name)?);
            let history = ctx.store.history_for(&key)?;
            vec![(key, history)]
        }
        (None, Some(desc)) => {
            let key = HistoryKey::task(desc);
            let history = ctx.store.history_for(&key)?;
            vec![(key, history)]
        }
        (None, None) => ctx.store.all_histories()?,
    };

    if args.json {
        let out: Vec<_> = entries
            .iter()
            .map(|(key, history)| serde_json::json!({ "key": key, "history": history }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("no history yet");
    }
    for (key, history) in &entries {
        println!("{}", history_line(key, history));
    }
    Ok(())
}

pub fn report(plan_id: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    let report = ctx.store.summarize(plan_id)?;
    if report.tasks.is_empty() {
        return Err(format!("no records for plan {plan_id}").into());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}

pub fn refine() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::open()?;
    match ctx.estimator.refine_from_store(ctx.store.as_ref())? {
        RefineOutcome::Refined { samples } => {
            println!("refined on {samples} samples");
            let params = ctx.estimator.params();
            for category in Category::ALL {
                println!(
                    "  {:<15} factor {:.2}  prior {}",
                    category.as_str(),
                    params.factor(category),
                    display_time(ctx.estimator.prior(category))
                );
            }
        }
        RefineOutcome::Skipped { new_samples } => {
            println!("skipped: {new_samples} new samples since last refine");
        }
    }
    Ok(())
}
