use std::sync::{Arc, RwLock};

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use yadisk_dircache::{
    AliasMapper, DirectoryCache, DirectoryView, PUBLIC_GROUP, ReadOptions, Settings, TreeNode,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    List(ListArgs),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListArgs {
    path: String,
    include_hidden: bool,
    public: bool,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut list = ListArgs {
        path: "/".to_string(),
        include_hidden: false,
        public: false,
    };
    let mut path_seen = false;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--hidden" => list.include_hidden = true,
            "--public" => list.public = true,
            "--help" | "-h" => return Ok(CliMode::Help),
            other if other.starts_with('-') => anyhow::bail!("unknown argument: {other}"),
            other if path_seen => anyhow::bail!("unexpected extra path: {other}"),
            other => {
                list.path = other.to_string();
                path_seen = true;
            }
        }
    }
    Ok(CliMode::List(list))
}

fn print_tree(node: &TreeNode, depth: usize) {
    let marker = if node.is_dir { "/" } else { "" };
    println!("{}{}{}", "  ".repeat(depth), node.name, marker);
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: yadisk-dircache [--hidden] [--public] [PATH]");
            println!("  --hidden   Include dot-files in the listing");
            println!("  --public   Group published folders under {PUBLIC_GROUP}");
            return Ok(());
        }
        CliMode::List(args) => args,
    };

    let settings = Settings::from_env().context("failed to read configuration")?;
    let transport = settings
        .transport()
        .context("failed to build Yandex Disk client")?;

    let mut aliases = AliasMapper::new();
    if args.public {
        let roots = transport
            .public_roots()
            .await
            .context("failed to enumerate published folders")?;
        let entries = aliases.rebuild_group(PUBLIC_GROUP, roots);
        tracing::info!(count = entries.len(), "registered published folders");
    }

    let cache = DirectoryCache::new(Arc::new(transport), settings.cache.clone());
    let view = DirectoryView::new(cache, Arc::new(RwLock::new(aliases)));
    let options = ReadOptions {
        include_hidden: args.include_hidden,
        ..ReadOptions::default()
    };
    let tree = view
        .open(&args.path, options)
        .await
        .with_context(|| format!("failed to list {}", args.path))?;
    print_tree(&tree, 0);
    Ok(())
}
