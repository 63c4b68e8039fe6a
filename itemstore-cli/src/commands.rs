use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use itemstore::prelude::*;
use serde_json::json;

use crate::output::{print_json, success, warning};
use crate::{Cli, Command, ListArgs};

pub async fn execute(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config)?;

    let repository = build_repository(&config)
        .await
        .with_context(|| format!("Failed to bring up the {} backend", config.storage.backend_name()))?;
    let service = ItemService::new(Arc::clone(&repository));

    match cli.command {
        Command::Ping => {
            service.ping().await?;
            print_json(&json!({ "backend": repository.backend(), "status": "ok" }))
        }
        Command::Create { name, price } => {
            let item = service.create(NewItem { name, price }).await?;
            success(&format!("Created item {}", item.id));
            print_json(&item)
        }
        Command::Get { id } => print_json(&service.get(id).await?),
        Command::Update {
            id,
            name,
            price,
            version,
        } => {
            let (name, price) = match (name, price) {
                (Some(name), Some(price)) => (name, price),
                (name, price) => {
                    let current = service.get(id).await?;
                    (name.unwrap_or(current.name), price.unwrap_or(current.price))
                }
            };
            let item = service
                .update(id, ItemUpdate { name, price, version })
                .await?;
            success(&format!("Updated item {} to version {}", item.id, item.version));
            print_json(&item)
        }
        Command::Delete { id } => {
            service.delete(id).await?;
            success(&format!("Deleted item {}", id));
            Ok(())
        }
        Command::List(args) => {
            let (filters, page) = list_query(&args);
            print_json(&service.list(&filters, page).await?)
        }
        Command::Health => {
            let checker = HealthChecker::new();
            checker.add_check("storage", Arc::new(RepositoryCheck::new(repository)));
            checker.set_ready(true);

            let readiness = checker.readiness().await;
            print_json(&json!({
                "liveness": checker.liveness(),
                "readiness": readiness,
            }))?;
            if !readiness.is_up() {
                warning("Storage backend is not ready");
                anyhow::bail!("readiness check failed");
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::load().context("Failed to load configuration")?,
    };
    config.validate()?;
    Ok(config)
}

/// Filters and pagination for `list`
fn list_query(args: &ListArgs) -> (Vec<Filter>, Option<Pagination>) {
    let mut filters = Vec::new();
    if let Some(name) = &args.name {
        filters.push(Filter::contains("name", name.as_str()));
    }
    if let Some(name) = &args.name_exact {
        filters.push(Filter::exact("name", name.as_str()));
    }
    if let Some(min) = args.min_price {
        filters.push(Filter::gte("price", min));
    }
    if let Some(max) = args.max_price {
        filters.push(Filter::lte("price", max));
    }

    let page = (args.limit > 0).then(|| Pagination::new(args.limit, args.offset));
    (filters, page)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("itemstore").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_list_query_from_flags() {
        let cli = parse(&["list", "--name", "phone", "--min-price", "10", "--limit", "2", "--offset", "1"]);
        let Command::List(args) = cli.command else {
            panic!("expected list");
        };

        let (filters, page) = list_query(&args);
        assert_eq!(
            filters,
            vec![Filter::contains("name", "phone"), Filter::gte("price", 10.0)]
        );
        assert_eq!(page, Some(Pagination::new(2, 1)));
    }

    #[test]
    fn test_list_without_limit_is_unpaginated() {
        let (filters, page) = list_query(&ListArgs::default());
        assert!(filters.is_empty());
        assert_eq!(page, None);
    }

    #[test]
    fn test_name_flags_conflict() {
        let result = Cli::try_parse_from(["itemstore", "list", "--name", "a", "--name-exact", "b"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_update_requires_version() {
        assert!(Cli::try_parse_from(["itemstore", "update", "1", "--price", "2"]).is_err());
        let cli = parse(&["update", "1", "--price", "2", "--version", "0"]);
        assert!(matches!(
            cli.command,
            Command::Update { id: 1, version: 0, name: None, .. }
        ));
    }
}
