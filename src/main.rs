use std::path::PathBuf;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use reqlog::{
    Record, RecordStore, SearchQuery, StorageBackend, TimeRange,
    client::{HttpResponse, HyperClient},
    config::Config,
    logging,
    replay::{Modifications, Replayer},
};

#[derive(Debug, Parser)]
#[command(name = "reqlog", version, about = "Browse and replay captured HTTP requests")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// List captured request ids, oldest first.
    List,
    /// Print one captured request as JSON.
    Show { id: String },
    /// Find captured requests by method, URL substring and time range.
    Search {
        #[arg(long)]
        method: Option<String>,
        #[arg(long)]
        url: Option<String>,
        /// Inclusive lower bound (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,
        /// Inclusive upper bound (RFC 3339 or YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,
    },
    /// Send a captured request again.
    Replay {
        id: String,
        /// Override a field before sending: method, url, json, data, timeout or header.<Name>.
        #[arg(long = "set", value_name = "FIELD=VALUE")]
        set: Vec<String>,
    },
    /// Delete a captured request.
    Delete { id: String },
    /// Rebuild the metadata index from stored records.
    RebuildIndex,
}

#[derive(Debug, Clone, PartialEq)]
enum CommandOutcome {
    Listed { ids: Vec<String> },
    Shown { record: Box<Record> },
    Found { records: Vec<Record> },
    Replayed { response: HttpResponse },
    Deleted { id: String },
    Reindexed { count: usize },
}

async fn run_command(store: &RecordStore, command: Command) -> anyhow::Result<CommandOutcome> {
    match command {
        Command::List => Ok(CommandOutcome::Listed {
            ids: store.list_ids().await.context("list request logs")?,
        }),
        Command::Show { id } => {
            let record = store.load(&id).await?;
            Ok(CommandOutcome::Shown {
                record: Box::new(record),
            })
        }
        Command::Search {
            method,
            url,
            start,
            end,
        } => {
            let query = SearchQuery {
                method,
                url,
                range: TimeRange::parse(start.as_deref(), end.as_deref())?,
            };
            if query.is_empty() {
                bail!("`search` needs at least one of --method, --url, --start or --end");
            }
            Ok(CommandOutcome::Found {
                records: store.search(&query).await.context("search request logs")?,
            })
        }
        Command::Replay { id, set } => {
            let modifications = if set.is_empty() {
                None
            } else {
                Some(Modifications::from_pairs(&set)?)
            };
            let client = HyperClient::new()?;
            let replayer = Replayer::new(std::sync::Arc::new(store.clone()), client);
            let response = replayer.replay(&id, modifications).await?;
            Ok(CommandOutcome::Replayed { response })
        }
        Command::Delete { id } => {
            store.load(&id).await?;
            store.delete(&id).await.context("delete request log")?;
            Ok(CommandOutcome::Deleted { id })
        }
        Command::RebuildIndex => match store.rebuild_index().await? {
            Some(count) => Ok(CommandOutcome::Reindexed { count }),
            None => bail!("no metadata index configured; set `[index].path` in config"),
        },
    }
}

fn render_outcome(outcome: &CommandOutcome) -> anyhow::Result<String> {
    let mut out = String::new();
    match outcome {
        CommandOutcome::Listed { ids } => {
            for id in ids {
                out.push_str(id);
                out.push('\n');
            }
        }
        CommandOutcome::Shown { record } => {
            out.push_str(&serde_json::to_string_pretty(record).context("render record")?);
            out.push('\n');
        }
        CommandOutcome::Found { records } => {
            for record in records {
                let timestamp = record
                    .timestamp
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_owned());
                out.push_str(&format!(
                    "{timestamp}  {:<7} {}  {}\n",
                    record.method, record.url, record.id
                ));
            }
        }
        CommandOutcome::Replayed { response } => {
            out.push_str(&format!("status: {}\n", response.status));
            for (name, value) in &response.headers {
                out.push_str(&format!("{name}: {value}\n"));
            }
            out.push('\n');
            out.push_str(&String::from_utf8_lossy(&response.body));
            if !response.body.ends_with(b"\n") {
                out.push('\n');
            }
        }
        CommandOutcome::Deleted { id } => out.push_str(&format!("deleted request `{id}`\n")),
        CommandOutcome::Reindexed { count } => {
            out.push_str(&format!("indexed {count} request logs\n"));
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;

    let store = RecordStore::from_config(&config)?;
    let outcome = run_command(&store, cli.command).await?;
    print!("{}", render_outcome(&outcome)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use clap::Parser;
    use reqlog::{
        MemoryStorage, RecordStore, RequestLogger, RequestSpec, client::HttpResponse,
        index::MetadataIndex,
    };

    use super::{Cli, Command, CommandOutcome, render_outcome, run_command};

    async fn store_with(urls: &[&str]) -> (RecordStore, Vec<String>) {
        let store = RecordStore::new(Arc::new(MemoryStorage::new()))
            .with_index(MetadataIndex::open_in_memory().unwrap());
        let logger = RequestLogger::new(Arc::new(store.clone()));
        let mut ids = Vec::new();
        for url in urls {
            let (id, _) = logger.capture(RequestSpec::get(*url)).await.unwrap();
            ids.push(id);
        }
        (store, ids)
    }

    #[test]
    fn replay_collects_repeated_set_flags() {
        let cli = Cli::try_parse_from([
            "reqlog",
            "replay",
            "abc",
            "--set",
            "method=PUT",
            "--set",
            "header.X-Debug=1",
            "--config",
            "custom.toml",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("custom.toml")));
        assert_eq!(
            cli.command,
            Command::Replay {
                id: "abc".to_owned(),
                set: vec!["method=PUT".to_owned(), "header.X-Debug=1".to_owned()],
            }
        );
    }

    #[test]
    fn rebuild_index_is_kebab_case() {
        let cli = Cli::try_parse_from(["reqlog", "rebuild-index"]).unwrap();
        assert_eq!(cli.command, Command::RebuildIndex);
    }

    #[tokio::test]
    async fn list_show_search_and_delete() {
        let (store, ids) =
            store_with(&["https://example.com/users", "https://example.com/orders"]).await;

        let listed = run_command(&store, Command::List).await.unwrap();
        assert_eq!(listed, CommandOutcome::Listed { ids: ids.clone() });

        let shown = run_command(&store, Command::Show { id: ids[1].clone() })
            .await
            .unwrap();
        let rendered = render_outcome(&shown).unwrap();
        assert!(rendered.contains("\"url\": \"https://example.com/orders\""), "{rendered}");

        let found = run_command(
            &store,
            Command::Search {
                method: Some("get".to_owned()),
                url: Some("USERS".to_owned()),
                start: None,
                end: None,
            },
        )
        .await
        .unwrap();
        let CommandOutcome::Found { records } = &found else {
            panic!("expected search results, got {found:?}");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, ids[0]);

        let deleted = run_command(&store, Command::Delete { id: ids[0].clone() })
            .await
            .unwrap();
        assert_eq!(
            render_outcome(&deleted).unwrap(),
            format!("deleted request `{}`\n", ids[0])
        );
        let err = run_command(&store, Command::Show { id: ids[0].clone() })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("was not found"), "{err}");
    }

    #[tokio::test]
    async fn empty_search_and_bad_ranges_are_rejected() {
        let (store, _) = store_with(&["https://example.com/"]).await;

        let err = run_command(
            &store,
            Command::Search {
                method: None,
                url: Some("  ".to_owned()),
                start: None,
                end: None,
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("needs at least one"), "{err}");

        let err = run_command(
            &store,
            Command::Search {
                method: None,
                url: None,
                start: Some("2024-02-01".to_owned()),
                end: Some("2024-01-01".to_owned()),
            },
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<reqlog::Error>().is_some(), "{err}");
    }

    #[tokio::test]
    async fn rebuild_index_reports_count() {
        let (store, _) = store_with(&["https://example.com/a", "https://example.com/b"]).await;
        let outcome = run_command(&store, Command::RebuildIndex).await.unwrap();
        assert_eq!(outcome, CommandOutcome::Reindexed { count: 2 });

        let unindexed = RecordStore::new(Arc::new(MemoryStorage::new()));
        let err = run_command(&unindexed, Command::RebuildIndex)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("[index].path"), "{err}");
    }

    #[test]
    fn replay_output_lists_status_headers_and_body() {
        let rendered = render_outcome(&CommandOutcome::Replayed {
            response: HttpResponse {
                status: 201,
                headers: vec![("content-type".to_owned(), "text/plain".to_owned())],
                body: Bytes::from_static(b"created"),
            },
        })
        .unwrap();
        assert_eq!(rendered, "status: 201\ncontent-type: text/plain\n\ncreated\n");
    }
}
