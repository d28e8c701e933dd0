//! An operator binary for a `midx` mailbox index: inspect it, rebuild it
//! after corruption, and hammer it with synthetic appends. Not part of any
//! backend's normal runtime path, just the `clap`-derived shape the teacher
//! uses for its own `main.rs` subcommands, narrowed to this crate's surface.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use midx::{sync_begin, MailboxConfig, SyncFlags, SyncOutcome, Transaction, TransactionFlags, View};
use midx_index::flags::Flag;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Directory holding `<prefix>`, `<prefix>.log`, `<prefix>.log.2` and
    /// `<prefix>.cache`.
    #[clap(short, long, env = "MIDX_DIR")]
    dir: PathBuf,

    /// File name prefix within `--dir`.
    #[clap(short, long, default_value = "dovecot.index")]
    prefix: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a brand-new mailbox index in an empty directory.
    Create,
    /// Print the header, every record and known extensions.
    Dump,
    /// Drive `sync_begin` to completion, discarding the stream of
    /// `SyncRec`s a real backend would apply.
    Sync,
    /// Force a full rebuild from the transaction log, as if the main index
    /// file were found corrupted on open.
    Fsck,
    /// Append `count` empty messages in `batch`-sized transactions,
    /// reporting elapsed time — a rough stand-in for the source's
    /// benchmarking tools.
    BenchAppend {
        #[clap(short, long, default_value_t = 1000)]
        count: u32,
        #[clap(short, long, default_value_t = 50)]
        batch: u32,
    },
}

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "midx=info,midx_cli=info");
    }
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let mut config = MailboxConfig::new(&args.dir);
    config.prefix = args.prefix;

    match args.command {
        Command::Create => cmd_create(config),
        Command::Dump => cmd_dump(config),
        Command::Sync => cmd_sync(config),
        Command::Fsck => cmd_fsck(config),
        Command::BenchAppend { count, batch } => cmd_bench_append(config, count, batch),
    }
}

fn cmd_create(config: MailboxConfig) -> Result<()> {
    let index = midx::Index::create(config).context("creating mailbox index")?;
    println!("created mailbox index at {}", index.main_path().display());
    Ok(())
}

fn cmd_dump(config: MailboxConfig) -> Result<()> {
    let index = open_or_bail(config)?;
    let view = View::open(&index).context("opening view")?;

    println!("uid_validity  = {}", view.uid_validity());
    println!("messages      = {}", view.messages_count());
    println!("next_uid      = {}", view.next_uid());
    println!("keywords      = {:?}", view.keyword_names());

    for seq in 1..=view.messages_count() {
        let Some(rec) = view.lookup(seq) else { continue };
        println!(
            "seq {seq:>6}  uid {:<6}  flags {:#04x}{}{}{}{}  keywords {:?}",
            rec.uid,
            rec.flags,
            if rec.flags & Flag::Seen as u8 != 0 { " \\Seen" } else { "" },
            if rec.flags & Flag::Answered as u8 != 0 { " \\Answered" } else { "" },
            if rec.flags & Flag::Flagged as u8 != 0 { " \\Flagged" } else { "" },
            if rec.flags & Flag::Deleted as u8 != 0 { " \\Deleted" } else { "" },
            view.keywords_of(seq),
        );
    }
    Ok(())
}

fn cmd_sync(config: MailboxConfig) -> Result<()> {
    let index = open_or_bail(config)?;
    let mut passes = 0u32;
    loop {
        match sync_begin(&index, SyncFlags::default())? {
            SyncOutcome::NoOp => break,
            SyncOutcome::Sync(mut ctx) => {
                let mut applied = 0u32;
                while ctx.next().is_some() {
                    applied += 1;
                }
                ctx.commit()?;
                passes += 1;
                println!("sync pass {passes}: {applied} record(s) applied");
            }
        }
    }
    if passes == 0 {
        println!("nothing to sync");
    }
    Ok(())
}

fn cmd_fsck(config: MailboxConfig) -> Result<()> {
    let index = open_or_bail(config)?;
    midx::sync::fsck(&index).context("running fsck")?;
    let view = View::open(&index)?;
    println!("fsck complete: {} message(s) recovered from the log", view.messages_count());
    Ok(())
}

fn cmd_bench_append(config: MailboxConfig, count: u32, batch: u32) -> Result<()> {
    if batch == 0 {
        bail!("--batch must be at least 1");
    }
    let index = open_or_bail(config)?;
    let start = Instant::now();

    let mut appended = 0u32;
    while appended < count {
        let this_batch = batch.min(count - appended);
        let view = View::open(&index)?;
        let mut txn = Transaction::new(&view, TransactionFlags::default());
        for _ in 0..this_batch {
            txn.append(0);
        }
        txn.commit(&index)?;
        appended += this_batch;
    }

    loop {
        match sync_begin(&index, SyncFlags::default())? {
            SyncOutcome::NoOp => break,
            SyncOutcome::Sync(mut ctx) => {
                while ctx.next().is_some() {}
                ctx.commit()?;
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "appended {count} message(s) in {} batch(es) of up to {batch} in {:.3}s ({:.0} msg/s)",
        count.div_ceil(batch),
        elapsed.as_secs_f64(),
        count as f64 / elapsed.as_secs_f64().max(1e-9),
    );
    Ok(())
}

fn open_or_bail(config: MailboxConfig) -> Result<midx::Index> {
    midx::Index::open(config).context("opening mailbox index (run `midx create` first, or `midx fsck` if it's corrupted)")
}
