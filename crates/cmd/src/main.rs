// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Whatever};

mod settings;
use settings::Settings;
use shmq_queue::{Queue, TopicStat};

#[derive(Debug, Parser)]
#[clap(name = "shmq", about = "Topic-based message queue over shared memory-mapped files", version)]
struct Cli {
    /// Settings file (TOML, YAML or JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory holding one subdirectory per topic.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Produce(ProduceArgs),
    Consume(ConsumeArgs),
    Stat(TopicArgs),
    Sweep(TopicArgs),
    Purge(TopicArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Enqueue messages and print the offset of each.
Without --message, every line of stdin becomes one message.
Examples:

shmq produce orders --message hello --message world
tail -f app.log | shmq produce logs

")]
struct ProduceArgs {
    topic: String,

    #[arg(short, long)]
    message: Vec<String>,
}

impl ProduceArgs {
    fn run(&self, settings: &Settings) -> Result<(), Whatever> {
        let queue = open_queue(settings, &self.topic)?;
        let mut producer = queue
            .create_producer()
            .whatever_context("Failed to create producer")?;
        let mut out = io::stdout().lock();

        if self.message.is_empty() {
            for line in io::stdin().lock().lines() {
                let line = line.whatever_context("Failed to read stdin")?;
                let offset = producer
                    .enqueue(line.as_bytes())
                    .whatever_context("Failed to enqueue")?;
                writeln!(out, "{offset}").whatever_context("Failed to write stdout")?;
            }
        } else {
            for message in &self.message {
                let offset = producer
                    .enqueue(message.as_bytes())
                    .whatever_context("Failed to enqueue")?;
                writeln!(out, "{offset}").whatever_context("Failed to write stdout")?;
            }
        }

        producer.close().whatever_context("Failed to close producer")
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Dequeue messages and print them as `<offset>\t<payload>`.
Without --group, an ephemeral group is used and removed on exit.
Exits once the topic stays empty for --timeout-ms, unless --follow is set.
Examples:

shmq consume orders --group billing
shmq consume logs --follow

")]
struct ConsumeArgs {
    topic: String,

    /// Named consumer group. Its position survives restarts.
    #[arg(short, long)]
    group: Option<String>,

    /// Keep waiting for new messages until interrupted.
    #[arg(short, long)]
    follow: bool,

    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,
}

impl ConsumeArgs {
    fn run(&self, settings: &Settings) -> Result<(), Whatever> {
        let stop = Arc::new(AtomicBool::new(false));
        {
            let stop = Arc::clone(&stop);
            ctrlc::set_handler(move || stop.store(true, Ordering::Release))
                .whatever_context("Failed to install Ctrl-C handler")?;
        }

        let queue = open_queue(settings, &self.topic)?;
        let mut reader = queue
            .create_reader(self.group.as_deref())
            .whatever_context("Failed to create reader")?;
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut out = io::stdout().lock();

        while !stop.load(Ordering::Acquire) {
            match reader
                .dequeue_timeout(timeout)
                .whatever_context("Failed to dequeue")?
            {
                Some(message) => {
                    writeln!(
                        out,
                        "{}\t{}",
                        message.offset,
                        String::from_utf8_lossy(&message.payload)
                    )
                    .whatever_context("Failed to write stdout")?;
                }
                None if self.follow => {}
                None => break,
            }
        }

        tracing::debug!(group = %reader.group(), "consumer stopped");
        reader.close().whatever_context("Failed to close reader")
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
struct TopicArgs {
    topic: String,
}

impl TopicArgs {
    fn stat(&self, settings: &Settings) -> Result<(), Whatever> {
        let stat = open_queue(settings, &self.topic)?
            .stat()
            .whatever_context("Failed to read topic")?;
        print!("{}", render_stat(&stat));
        Ok(())
    }

    fn sweep(&self, settings: &Settings) -> Result<(), Whatever> {
        let removed = open_queue(settings, &self.topic)?
            .sweep()
            .whatever_context("Failed to sweep topic")?;
        println!("removed {} carriage(s) {removed:?}", removed.len());
        Ok(())
    }

    fn purge(&self, settings: &Settings) -> Result<(), Whatever> {
        open_queue(settings, &self.topic)?
            .delete_topic()
            .whatever_context("Failed to delete topic")?;
        println!("deleted topic {}", self.topic);
        Ok(())
    }
}

fn open_queue(settings: &Settings, topic: &str) -> Result<Queue, Whatever> {
    settings
        .queue_builder(topic)
        .build()
        .with_whatever_context(|_| format!("Failed to open topic {topic}"))
}

fn render_stat(stat: &TopicStat) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(out, "topic:        {}", stat.topic);
    let _ = writeln!(out, "dir:          {}", stat.dir.display());
    match stat.sizing {
        Some(sizing) => {
            let _ = writeln!(out, "capacity:     {}", sizing.carriage_capacity);
            let _ = writeln!(out, "max message:  {}", sizing.max_message_size);
        }
        None => {
            let _ = writeln!(out, "capacity:     (no producer yet)");
        }
    }
    let _ = writeln!(out, "total offset: {}", stat.total_offset);
    let _ = writeln!(out, "carriages:    {:?}", stat.carriages);
    for group in &stat.groups {
        let _ = writeln!(
            out,
            "group {}: next {} lag {}",
            group.group, group.next_offset, group.lag
        );
    }
    out
}

fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load(cli.config.as_deref()).whatever_context("Failed to load settings")?;
    if let Some(root) = cli.root {
        settings.root = root;
    }

    let _guards = shmq_common_telemetry::init_global_logging("shmq", &settings.logging)
        .whatever_context("Failed to initialize logging")?;
    shmq_common_telemetry::set_panic_hook();

    match cli.commands {
        Commands::Produce(args) => args.run(&settings),
        Commands::Consume(args) => args.run(&settings),
        Commands::Stat(args) => args.stat(&settings),
        Commands::Sweep(args) => args.sweep(&settings),
        Commands::Purge(args) => args.purge(&settings),
    }
}
