use clap::Parser;
use client::network::{Action, Client};
use log::{info, warn};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// User ID to log in as
    #[arg(short = 'u', long)]
    user: String,

    /// Change the display name
    #[arg(long)]
    rename: Option<String>,

    /// Add an item to the inventory (repeatable)
    #[arg(long = "add-item")]
    add_items: Vec<String>,

    /// Remove an item from the inventory (repeatable)
    #[arg(long = "remove-item")]
    remove_items: Vec<String>,

    /// Spend gold
    #[arg(long)]
    spend_gold: Option<i64>,

    /// Gain experience
    #[arg(long = "gain-xp")]
    gain_xp: Option<i64>,

    /// Grant gold to another player, as TARGET=AMOUNT (admins only)
    #[arg(long = "grant-gold", value_parser = parse_grant::<i64>)]
    grant_gold: Vec<(String, i64)>,

    /// How long to keep receiving pushes before disconnecting
    #[arg(long, default_value = "500")]
    linger_ms: u64,
}

impl Args {
    fn actions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(name) = &self.rename {
            actions.push(Action::Rename(name.clone()));
        }
        actions.extend(self.add_items.iter().cloned().map(Action::AddItem));
        actions.extend(self.remove_items.iter().cloned().map(Action::RemoveItem));
        if let Some(amount) = self.spend_gold {
            actions.push(Action::SpendGold(amount));
        }
        if let Some(amount) = self.gain_xp {
            actions.push(Action::GainExperience(amount));
        }
        actions.extend(
            self.grant_gold
                .iter()
                .map(|(target, amount)| Action::GrantGold {
                    target: target.clone(),
                    amount: *amount,
                }),
        );
        actions
    }
}

fn parse_grant<T: std::str::FromStr>(arg: &str) -> Result<(String, T), String> {
    let (target, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected TARGET=VALUE, got '{}'", arg))?;
    let value = value
        .parse()
        .map_err(|_| format!("invalid value '{}'", value))?;
    Ok((target.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    let mut client = Client::new(&args.server).await?;
    client.connect().await?;

    let reply = client.login(&args.user).await?;
    if !reply.is_success() {
        client.disconnect().await?;
        return Err(format!(
            "login failed: {}",
            reply.message.unwrap_or_else(|| format!("{:?}", reply.status))
        )
        .into());
    }

    for action in args.actions() {
        let reply = client.perform(&action).await?;
        if !reply.is_success() {
            warn!(
                "{:?} was refused: {}",
                action,
                reply.message.as_deref().unwrap_or("no reason given")
            );
        }
    }

    client.poll(Duration::from_millis(args.linger_ms)).await?;
    println!("{}", client.mirror().summary());

    client.disconnect().await?;
    Ok(())
}
