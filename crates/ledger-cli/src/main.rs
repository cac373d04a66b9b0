mod input;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use input::{is_done, parse_amount, Prompter};
use ledger_core::{
    chain::Chain,
    constants::{DEFAULT_DB_PATH, DEFAULT_DIFFICULTY},
    Block, LedgerError, TransferRecord,
};
use ledger_storage::SledStore;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ledger-cli")]
#[command(about = "Mine blocks of transfers into a local proof-of-work ledger")]
struct Cli {
    /// Ledger database location
    #[arg(long, default_value = DEFAULT_DB_PATH)]
    db: PathBuf,

    /// Leading zero hex digits required of each mined block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: u32,

    /// Search nonces on all cores
    #[arg(long)]
    parallel: bool,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive menu (the default)
    Menu,
    /// Check indices, linkage, hashes and work of the stored chain
    Verify,
}

enum Flow {
    Continue,
    Exit,
}

type Ledger = Chain<SledStore>;

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = SledStore::open(&cli.db)?;
    let chain = Chain::open(Arc::new(store))?;

    let outcome = match cli.cmd.unwrap_or(Command::Menu) {
        Command::Menu => run_menu(&chain, cli.difficulty, cli.parallel).await,
        Command::Verify => verify(&chain),
    };
    chain.close()?;
    outcome
}

fn verify(chain: &Ledger) -> Result<()> {
    let faults = chain.verify()?;
    if faults.is_empty() {
        let height = chain.get_latest_block()?.map(|b| b.index).unwrap_or(0);
        println!("Chain OK: {} blocks verified", height + 1);
        return Ok(());
    }
    for fault in &faults {
        println!("FAULT: {fault}");
    }
    bail!("chain verification found {} fault(s)", faults.len())
}

async fn run_menu(chain: &Ledger, difficulty: u32, parallel: bool) -> Result<()> {
    let mut prompt = Prompter::stdin();
    loop {
        println!("\nMenu:");
        println!("1. Add new transactions and mine a block");
        println!("2. Query transactions by sender");
        println!("3. Print the entire blockchain");
        println!("4. Exit");
        let Some(choice) = prompt.ask("Enter choice (1-4): ").await? else {
            break;
        };

        let result = match choice.trim() {
            "1" => add_transactions(chain, &mut prompt, difficulty, parallel).await,
            "2" => query_sender(chain, &mut prompt).await,
            "3" => print_chain(chain),
            "4" => {
                println!("Exiting...");
                break;
            }
            _ => {
                println!("Invalid choice. Try again.");
                Ok(Flow::Continue)
            }
        };

        match result {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => break,
            // Recoverable engine errors abort only the current action.
            Err(e) => match e.downcast_ref::<LedgerError>() {
                Some(err) if !err.is_fatal() => println!("Error: {err}"),
                _ => return Err(e),
            },
        }
    }
    Ok(())
}

async fn add_transactions(
    chain: &Ledger,
    prompt: &mut Prompter,
    difficulty: u32,
    parallel: bool,
) -> Result<Flow> {
    // End of input or Ctrl-C mid-entry drops the batch unmined.
    let mut records = Vec::new();
    loop {
        let Some(sender) = prompt.ask("Enter sender name (or 'done' to finish): ").await? else {
            return Ok(Flow::Exit);
        };
        if is_done(&sender) {
            break;
        }
        let Some(recipient) = prompt.ask("Enter recipient name: ").await? else {
            return Ok(Flow::Exit);
        };
        let Some(raw) = prompt.ask("Enter amount: ").await? else {
            return Ok(Flow::Exit);
        };
        let amount = match parse_amount(&raw) {
            Ok(amount) => amount,
            Err(e) => {
                warn!(error = %e, "rejected amount");
                println!("Invalid amount. Try again.");
                continue;
            }
        };
        records.push(TransferRecord::new(sender, recipient, amount));
        println!("Transaction added.");
    }

    if records.is_empty() {
        println!("No transactions to add.");
        return Ok(Flow::Continue);
    }

    // Single writer, so the head read here is the one the engine extends.
    let next = chain.get_latest_block()?.map_or(0, |head| head.index + 1);
    println!("Mining block {next}...");
    let block = mine(chain, records, difficulty, parallel).await?;
    println!("Block {} mined with hash {}", block.index, block.hash);
    Ok(Flow::Continue)
}

/// Run the search off the async runtime so Ctrl-C can raise the cancel flag.
async fn mine(
    chain: &Ledger,
    records: Vec<TransferRecord>,
    difficulty: u32,
    parallel: bool,
) -> Result<Block> {
    let cancel = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let chain = chain.clone();
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            if parallel {
                chain.add_block_parallel_cancellable(records, difficulty, &cancel)
            } else {
                chain.add_block_cancellable(records, difficulty, &cancel)
            }
        })
    };

    let mined = tokio::select! {
        joined = &mut worker => joined?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, cancelling search");
            cancel.store(true, Ordering::Relaxed);
            worker.await?
        }
    };
    Ok(mined?)
}

async fn query_sender(chain: &Ledger, prompt: &mut Prompter) -> Result<Flow> {
    let Some(sender) = prompt.ask("Enter sender name to query transactions: ").await? else {
        return Ok(Flow::Exit);
    };
    let txs = chain.get_transactions_by_sender(&sender)?;
    if txs.is_empty() {
        println!("No transactions found for this sender.");
        return Ok(Flow::Continue);
    }
    println!("Transactions by {sender}:");
    for tx in txs {
        println!(
            "  ID: {}, Block ID: {}, Recipient: {}, Amount: {:?}",
            tx.id, tx.block_id, tx.recipient, tx.amount
        );
    }
    Ok(Flow::Continue)
}

fn print_chain(chain: &Ledger) -> Result<Flow> {
    let stdout = std::io::stdout();
    chain.print_chain(&mut stdout.lock())?;
    Ok(Flow::Continue)
}
