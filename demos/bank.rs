//! Bank account demo: an `account` aggregate plus a balance projection
//! running as a named subscription over the in-memory store.
//!
//! Run with: `cargo run --example bank`
//!
//! Set `RUST_LOG=eventfold_runtime=debug` to watch commands being folded and
//! checkpoints being written.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eventfold_runtime::{
    Aggregate, ApplicationBuilder, CommandOutcome, Error, InMemoryMessageStore, Message,
    MessageType, Subscription, SubscriptionConfig, SubscriptionIdentity, log_error,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Account aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Open {
    account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Opened {
    account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposit {
    account_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposited {
    account_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Withdraw {
    account_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Withdrawn {
    account_id: String,
    amount: u64,
}

#[derive(Debug, Clone, Default)]
struct Account {
    open: bool,
    balance: u64,
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error("account is not open")]
    NotOpen,
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: u64, requested: u64 },
}

fn open() -> MessageType<Open> {
    MessageType::new("Open")
}
fn opened() -> MessageType<Opened> {
    MessageType::new("Opened")
}
fn deposit() -> MessageType<Deposit> {
    MessageType::new("Deposit")
}
fn deposited() -> MessageType<Deposited> {
    MessageType::new("Deposited")
}
fn withdraw() -> MessageType<Withdraw> {
    MessageType::new("Withdraw")
}
fn withdrawn() -> MessageType<Withdrawn> {
    MessageType::new("Withdrawn")
}

fn account() -> Result<Aggregate<Account>, Error> {
    Ok(Aggregate::new("account", "account_id", Account::default())?
        .command(&open(), |state: &Account, cmd: Open| {
            if state.open {
                return CommandOutcome::NoOp;
            }
            CommandOutcome::emit(&opened(), &Opened { account_id: cmd.account_id })
        })
        .command(&deposit(), |state: &Account, cmd: Deposit| {
            if !state.open {
                return CommandOutcome::reject(AccountError::NotOpen);
            }
            CommandOutcome::emit(
                &deposited(),
                &Deposited {
                    account_id: cmd.account_id,
                    amount: cmd.amount,
                },
            )
        })
        .command(&withdraw(), |state: &Account, cmd: Withdraw| {
            if cmd.amount > state.balance {
                return CommandOutcome::reject(AccountError::InsufficientFunds {
                    balance: state.balance,
                    requested: cmd.amount,
                });
            }
            CommandOutcome::emit(
                &withdrawn(),
                &Withdrawn {
                    account_id: cmd.account_id,
                    amount: cmd.amount,
                },
            )
        })
        .event(&opened(), |state: Account, _: Opened| Account { open: true, ..state })
        .event(&deposited(), |state: Account, e: Deposited| Account {
            balance: state.balance + e.amount,
            ..state
        })
        .event(&withdrawn(), |state: Account, e: Withdrawn| Account {
            balance: state.balance - e.amount,
            ..state
        }))
}

// ---------------------------------------------------------------------------
// Balance projection
// ---------------------------------------------------------------------------

type Balances = Arc<Mutex<BTreeMap<String, u64>>>;

fn balances(view: &Balances) -> Subscription {
    let on_deposit = Arc::clone(view);
    let on_withdraw = Arc::clone(view);
    Subscription::new("account", SubscriptionIdentity::named("balances"), log_error)
        .config(SubscriptionConfig {
            poll_interval: Duration::from_millis(20),
            ..SubscriptionConfig::default()
        })
        .handle(&deposited(), move |e: Deposited, _: Message| {
            if let Ok(mut view) = on_deposit.lock() {
                *view.entry(e.account_id).or_default() += e.amount;
            }
            std::future::ready(Ok::<_, Infallible>(()))
        })
        .handle(&withdrawn(), move |e: Withdrawn, _: Message| {
            if let Ok(mut view) = on_withdraw.lock() {
                let balance = view.entry(e.account_id).or_default();
                *balance = balance.saturating_sub(e.amount);
            }
            std::future::ready(Ok::<_, Infallible>(()))
        })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Arc::new(InMemoryMessageStore::new());
    let view = Balances::default();
    let app = ApplicationBuilder::new(store.clone())
        .aggregate(account()?)
        .subscription(balances(&view))
        .build()?;

    let stop = app.start().await;

    app.dispatch(Uuid::new_v4(), open().envelope(&Open { account_id: "alice".into() })?)
        .await?;
    app.dispatch(Uuid::new_v4(), open().envelope(&Open { account_id: "bob".into() })?)
        .await?;
    for (account_id, amount) in [("alice", 100), ("bob", 40), ("alice", 25)] {
        let command = deposit().envelope(&Deposit {
            account_id: account_id.into(),
            amount,
        })?;
        app.dispatch(Uuid::new_v4(), command).await?;
    }

    let overdraft = withdraw().envelope(&Withdraw {
        account_id: "bob".into(),
        amount: 500,
    })?;
    match app.dispatch(Uuid::new_v4(), overdraft).await {
        Err(err) => println!("withdrawal refused: {err}"),
        Ok(version) => println!("unexpected withdrawal at version {version:?}"),
    }

    let withdrawal = withdraw().envelope(&Withdraw {
        account_id: "alice".into(),
        amount: 30,
    })?;
    app.dispatch(Uuid::new_v4(), withdrawal).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    stop.stop().await;

    if let Ok(view) = view.lock() {
        for (account_id, balance) in view.iter() {
            println!("{account_id}: {balance}");
        }
    }
    println!("{} messages in the log", store.len());
    Ok(())
}
