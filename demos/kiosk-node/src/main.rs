use clap::{Parser, Subcommand};
use kiosk::prelude::*;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kiosk-node", about = "Run an order server or a kiosk client")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve a small demo catalog and accept kiosks.
    Server {
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
    },
    /// Connect to a server and mirror its registries.
    Client {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        /// Sent to the server in the handshake.
        #[arg(short, long, default_value = "kiosk-1")]
        id: String,
        /// Submit one demo order for this customer once connected.
        #[arg(long)]
        order: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Demo catalog
// ---------------------------------------------------------------------------

fn temperature() -> OptionGroup {
    let option = |id: &str, name: &str| MenuOption {
        id: id.into(),
        name: name.into(),
        extra_cost: 0,
    };
    OptionGroup {
        id: "temperature".into(),
        name: "Temperature".into(),
        required: true,
        options: vec![option("hot", "Hot"), option("iced", "Iced")],
    }
}

fn menu(id: &str, name: &str, price: i64) -> Menu {
    Menu {
        id: id.into(),
        name: name.into(),
        price,
        category_id: "coffee".into(),
        image_path: format!("img/{id}.png"),
        description: String::new(),
        option_groups: vec![temperature()],
    }
}

fn seed_catalog() -> RegistryManager {
    let registries = RegistryManager::standard();
    let menus = vec![
        menu("americano", "Americano", 3000),
        menu("latte", "Latte", 4500),
    ];
    let group = temperature();

    if let Some(options) = registries.typed::<MenuOption, ReplaceById>(registry_ids::OPTIONS) {
        options.replace_all(group.options.clone());
    }
    if let Some(groups) = registries.typed::<OptionGroup, ReplaceById>(registry_ids::OPTION_GROUPS) {
        groups.replace_all(vec![group]);
    }
    if let Some(categories) = registries.categories() {
        categories.replace_all(vec![Category {
            id: "coffee".into(),
            name: "Coffee".into(),
            menus: menus.clone(),
        }]);
    }
    if let Some(registry) = registries.menus() {
        registry.replace_all(menus);
    }
    registries
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

async fn run_server(bind: String) -> Result<(), KioskError> {
    let server = KioskServer::builder()
        .bind(&bind)
        .registries(Arc::new(seed_catalog()))
        .build()
        .await?;
    let handle = server.handle();

    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(?event, "server event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "server events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let stopper = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    server.run().await
}

async fn run_client(config: ClientConfig, order: Option<String>) {
    let client = KioskClient::start(config, Arc::new(RegistryManager::standard()));
    let mut events = client.subscribe();
    let mut order = order;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    info!(?event, "client event");
                    let menus_synced = matches!(
                        &event,
                        ClientEvent::RegistrySynced { registry_id } if registry_id == registry_ids::MENUS
                    );
                    if menus_synced {
                        if let Some(customer) = order.take() {
                            submit_demo_order(&client, customer).await;
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "client events dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
}

async fn submit_demo_order(client: &KioskClient, customer: String) {
    let Some(latte) = client.registries().menus().and_then(|m| m.get("latte")) else {
        warn!("no latte in the catalog; ordering an empty cart");
        client.submit_order(Order::checkout(customer, now_millis(), Cart::default()));
        return;
    };
    let cart = Cart {
        items: vec![OrderItem {
            menu: latte,
            selected_options: Vec::new(),
            quantity: 1,
        }],
    };
    if let Some(pending) = client.submit_order(Order::checkout(customer, now_millis(), cart)) {
        if let Err(e) = pending.wait().await {
            warn!(error = %e, "order not sent");
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Args::parse().mode {
        Mode::Server { bind } => {
            info!(%bind, "starting order server");
            run_server(bind).await?;
        }
        Mode::Client {
            host,
            port,
            id,
            order,
        } => {
            info!(%host, port, %id, "starting kiosk client");
            run_client(ClientConfig::new(host, port, id), order).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_catalog_fills_every_catalog_registry() {
        let registries = seed_catalog();
        assert_eq!(registries.require(registry_ids::MENUS).unwrap().len(), 2);
        assert_eq!(registries.require(registry_ids::CATEGORIES).unwrap().len(), 1);
        assert_eq!(registries.require(registry_ids::OPTION_GROUPS).unwrap().len(), 1);
        assert_eq!(registries.require(registry_ids::OPTIONS).unwrap().len(), 2);
        assert!(registries.require(registry_ids::ORDERS).unwrap().is_empty());
        assert!(registries.menus().unwrap().is_frozen());
    }

    #[tokio::test]
    async fn test_client_mirrors_seeded_server() {
        let server = KioskServer::builder()
            .bind("127.0.0.1:0")
            .registries(Arc::new(seed_catalog()))
            .build()
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let handle = server.handle();
        tokio::spawn(server.run());

        let client = KioskClient::start(
            ClientConfig::new("127.0.0.1", port, "test"),
            Arc::new(RegistryManager::standard()),
        );
        let mut events = client.subscribe();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Ok(ClientEvent::RegistrySynced { registry_id }) = events.recv().await {
                    if registry_id == registry_ids::CATEGORIES {
                        break;
                    }
                }
            }
        })
        .await
        .unwrap();

        let categories = client.registries().categories().unwrap().get_all();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].menus.len(), 2);

        client.shutdown().await;
        handle.shutdown();
    }
}
