use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jsonata_sql::db::{create_client, introspect_schema, literal_json, SavedConnections};
use jsonata_sql::sql::{compile_expr, format_sql_parameterized, Literal, SelectItem, SelectQuery};
use jsonata_sql::translate::{functions_by_tier, SupportTier, FUNCTIONS};
use jsonata_sql::{
    load_schema_file, validate, CompiledQuery, Compiler, DomainAdapter, DomainConfig, Params,
};
use tracing::Level;

/// Compile JSONata-style expressions into PostgreSQL queries
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Log translation details to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile an expression and print the SQL with its parameters
    Compile {
        expression: String,
        /// Schema description (.toml or .json)
        #[arg(long)]
        schema: PathBuf,
        /// Expression variable, as name=value (value parsed as JSON when it can be)
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Print indented SQL
        #[arg(long)]
        pretty: bool,
        /// Print the statement taken apart into clauses
        #[arg(long)]
        parts: bool,
    },
    /// Check that an expression stays inside the translatable subset
    Validate { expression: String },
    /// List the function catalog
    Functions {
        /// Only functions of this tier (full, partial, unsupported, contextual)
        #[arg(long)]
        tier: Option<String>,
    },
    /// Compile a publication filter and show it applied to a query
    Filter {
        expression: String,
        #[arg(long)]
        schema: PathBuf,
        #[arg(long, default_value = "")]
        namespace: String,
        /// Domain adapter settings (.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Compile an expression and run it against a saved connection
    Run {
        expression: String,
        #[arg(long)]
        schema: PathBuf,
        /// Saved connection name
        #[arg(long)]
        connect: String,
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
    },
    /// Write a schema description for a live database as TOML
    Introspect {
        #[arg(long)]
        connect: String,
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    match cli.command {
        Command::Compile {
            expression,
            schema,
            params,
            pretty,
            parts,
        } => {
            let compiler = Compiler::new(load_schema_file(&schema)?);
            let query = compiler.compile(&expression, &parse_params(&params)?)?;
            if parts {
                print_parts(&query);
            } else if pretty {
                println!("{}", query.to_pretty_sql());
            } else {
                println!("{}", query.sql());
            }
            print_parameters(query.parameters());
        }
        Command::Validate { expression } => {
            let report = validate(&expression);
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.valid {
                std::process::exit(1);
            }
        }
        Command::Functions { tier } => {
            let specs: Vec<_> = match tier {
                Some(name) => {
                    let Some(tier) = SupportTier::parse(&name) else {
                        bail!("unknown tier {:?}", name);
                    };
                    functions_by_tier(tier).collect()
                }
                None => FUNCTIONS.iter().collect(),
            };
            for spec in specs {
                println!(
                    "${:<16} {:<12} {:<10} {}",
                    spec.name,
                    spec.tier.as_str(),
                    spec.category,
                    spec.sql
                );
                if !spec.caveats.is_empty() {
                    println!("{:>41}{}", "", spec.caveats);
                }
            }
        }
        Command::Filter {
            expression,
            schema,
            namespace,
            config,
        } => {
            let schema = load_schema_file(&schema)?;
            let config = match config {
                Some(path) => {
                    let content = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    toml::from_str(&content)
                        .with_context(|| format!("Invalid adapter config: {}", path.display()))?
                }
                None => DomainConfig::default(),
            };
            let adapter = DomainAdapter::new(&schema, config)?;
            let filter = adapter.compile_filter(&expression, &namespace)?;
            println!("-- {}", filter.expanded_expression);

            let alias = "p";
            let mut query = SelectQuery::from_table(&filter.table, alias);
            query.projections = vec![SelectItem::QualifiedWildcard(alias.into())];
            filter.apply(&mut query, alias);
            query.order_by = filter.order_by(alias);
            query.limit = filter.limit;
            query.offset = filter.offset;
            let (sql, parameters) = format_sql_parameterized(&query);
            println!("{}", sql);
            print_parameters(&parameters);
        }
        Command::Run {
            expression,
            schema,
            connect,
            params,
        } => {
            let compiler = Compiler::new(load_schema_file(&schema)?);
            let query = compiler.compile(&expression, &parse_params(&params)?)?;
            let client = connect_saved(&connect).await?;
            let rows = query.execute(&client, None).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Introspect { connect, output } => {
            let saved = SavedConnections::load()?;
            let config = saved
                .find(&connect)
                .with_context(|| format!("No saved connection named {:?}", connect))?;
            let client = connect_saved(&connect).await?;
            let raw = introspect_schema(&client, &config.schema).await?;
            let text = toml::to_string_pretty(&raw).context("Failed to serialize schema")?;
            match output {
                Some(path) => std::fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => print!("{}", text),
            }
        }
    }

    Ok(())
}

async fn connect_saved(name: &str) -> Result<tokio_postgres::Client> {
    let saved = SavedConnections::load()?;
    let Some(config) = saved.find(name) else {
        let names: Vec<&str> = saved.connections.iter().map(|c| c.name.as_str()).collect();
        bail!(
            "No saved connection named {:?} (saved: {})",
            name,
            names.join(", ")
        );
    };
    let mut config = config.clone();
    config.resolve_password()?;
    create_client(&config).await
}

fn parse_params(raw: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for item in raw {
        let Some((name, value)) = item.split_once('=') else {
            bail!("parameter {:?} is not NAME=VALUE", item);
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(name.trim_start_matches('$').to_string(), value);
    }
    Ok(params)
}

fn print_parameters(parameters: &[Literal]) {
    for (i, lit) in parameters.iter().enumerate() {
        println!("-- ${} = {}", i + 1, literal_json(lit));
    }
}

fn print_parts(query: &CompiledQuery) {
    let parts = query.get_parts();
    if let (Some(table), Some(alias)) = (&parts.table, &parts.alias) {
        println!("from:       {} AS {}", table, alias);
    }
    for item in &parts.projection {
        match item {
            SelectItem::QualifiedWildcard(alias) => println!("select:     {}.*", alias),
            SelectItem::Expression { expr, alias } => match alias {
                Some(alias) => println!("select:     {} AS {}", compile_expr(expr), alias),
                None => println!("select:     {}", compile_expr(expr)),
            },
        }
    }
    for join in &parts.joins {
        println!("join:       {:?} ON {}", join.join_type, compile_expr(&join.on));
    }
    for filter in &parts.filters {
        println!("where:      {}", compile_expr(filter));
    }
    for order in &parts.order_by {
        let direction = if order.asc == Some(false) { " DESC" } else { "" };
        println!("order by:   {}{}", compile_expr(&order.expr), direction);
    }
    if let Some(limit) = parts.limit {
        println!("limit:      {}", limit);
    }
    if let Some(offset) = parts.offset {
        println!("offset:     {}", offset);
    }
}
