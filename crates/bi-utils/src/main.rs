//! `biu` - CLI for bi-utils
//!
//! This binary exposes the library's file, query, data-quality, S3 and
//! warehouse helpers on the command line.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use clap::Parser;

use bi_utils::aws::db;
use bi_utils::aws::s3::s3_uri;
use bi_utils::cli::{
    Cli, Command, ConfigCommand, DbCommand, FilesCommand, QaCommand, QueryCommand, S3Command,
    SystemCommand,
};
use bi_utils::frame::{read_csv, CsvReadOptions};
use bi_utils::sql::{get_query, SqlValue};
use bi_utils::{files, qa, system};
use bi_utils::{init_logging, Config, ExportTarget, QueueExporter, Warehouse};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validation problems are reported by `config validate` rather than here
    if let Command::Config(config_cmd) = cli.command {
        return handle_config(cli.config, config_cmd);
    }

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Config(_) => Ok(()),
        Command::Query(query_cmd) => handle_query(&query_cmd),
        Command::Files(files_cmd) => handle_files(files_cmd),
        Command::System(system_cmd) => handle_system(&system_cmd),
        Command::Qa(qa_cmd) => handle_qa(&qa_cmd),
        Command::S3(s3_cmd) => {
            let wh = Warehouse::from_config(config).await;
            handle_s3(&wh, s3_cmd).await
        }
        Command::Db(db_cmd) => {
            let wh = Warehouse::from_config(config).await;
            handle_db(wh, db_cmd).await
        }
    }
}

fn handle_config(path: Option<std::path::PathBuf>, cmd: ConfigCommand) -> CliResult {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[AWS]");
                println!("  Secret id:          {}", config.aws.secret_id);
                println!(
                    "  Region:             {}",
                    config.aws.region.as_deref().unwrap_or("(environment)")
                );
                println!(
                    "  Endpoint:           {}",
                    config.aws.endpoint_url.as_deref().unwrap_or("(default)")
                );
                println!(
                    "  IAM role:           {}",
                    config.aws.iam_role.as_deref().unwrap_or("(access keys)")
                );
                println!();
                println!("[Warehouse]");
                println!("  Bucket:             {}", config.warehouse.bucket);
                println!("  Bucket dir:         {}", config.warehouse.bucket_dir);
                println!("  Temp dir:           {}", config.warehouse.temp_dir.display());
                println!("  Retries:            {}", config.warehouse.retries);
                println!("  Max chunk (MB):     {}", config.warehouse.max_chunk_size_mb);
                println!("  Delete S3 after:    {}", config.warehouse.delete_s3_after);
                println!();
                println!("[Export]");
                println!("  Worker name:        {}", config.export.worker_name);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.or(path).unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

fn handle_query(cmd: &QueryCommand) -> CliResult {
    let QueryCommand::Render { path, .. } = cmd;
    println!("{}", get_query(path, &cmd.query_params())?);
    Ok(())
}

fn handle_files(cmd: FilesCommand) -> CliResult {
    match cmd {
        FilesCommand::Columns { csv, separator } => {
            for column in files::csv_columns(&csv, separator)? {
                println!("{column}");
            }
        }
        FilesCommand::Name { data, date, ext } => {
            let name = match date {
                Some(date) => files::data_filename(&data, date, ext.as_deref()),
                None => files::data_filename_today(&data, ext.as_deref()),
            };
            println!("{name}");
        }
    }
    Ok(())
}

fn handle_system(cmd: &SystemCommand) -> CliResult {
    match cmd {
        SystemCommand::Ram => println!("{}", system::ram_usage()?),
        SystemCommand::Size { bytes } => println!("{}", system::verbose_size(*bytes)),
    }
    Ok(())
}

fn handle_qa(cmd: &QaCommand) -> CliResult {
    let frame = read_csv(&cmd.csv, &CsvReadOptions::default().with_separator(cmd.separator))?;
    let failcount = qa::df_test(&frame, &cmd.qa_options())?;
    println!("QA failcount: {failcount}");
    Ok(())
}

async fn handle_s3(wh: &Warehouse, cmd: S3Command) -> CliResult {
    let defaults = &wh.config().warehouse;
    match cmd {
        S3Command::Upload { file, bucket, dir } => {
            let bucket = bucket.unwrap_or_else(|| defaults.bucket.clone());
            let dir = dir.unwrap_or_else(|| defaults.bucket_dir.clone());
            let key = wh.object_store().upload_file(&file, &bucket, &dir).await?;
            println!("{}", s3_uri(&bucket, &key));
        }
        S3Command::Download { key, dest, bucket } => {
            let bucket = bucket.unwrap_or_else(|| defaults.bucket.clone());
            let path = wh.object_store().download_file(&bucket, &key, &dest).await?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn handle_db(wh: Warehouse, cmd: DbCommand) -> CliResult {
    let conditions = cmd.conditions();
    match cmd {
        DbCommand::Upload {
            file,
            schema,
            table,
            separator,
        } => {
            let opts = wh.upload_options().with_separator(separator);
            db::upload_file(&wh, &file, &schema, &table, &opts).await?;
        }
        DbCommand::Download { query, dir, format } => {
            let mut opts = wh.download_options().with_format(format.into());
            if let Some(dir) = dir {
                opts = opts.with_data_dir(dir);
            }
            for path in db::download_files(&wh, &query, &opts).await? {
                println!("{}", path.display());
            }
        }
        DbCommand::Unload { query, format } => {
            let opts = db::UnloadOptions {
                format: format.into(),
                ..wh.unload_options()
            };
            println!("{}", db::unload_data(&wh, &query, &opts).await?);
        }
        DbCommand::Delete { schema, table, .. } => {
            let conditions: Vec<(&str, SqlValue)> = conditions
                .iter()
                .map(|(column, value)| (column.as_str(), value.clone()))
                .collect();
            let deleted = db::delete(&wh, &table, &schema, &conditions, &Default::default()).await?;
            println!("Deleted {deleted} rows");
        }
        DbCommand::Columns { schema, table } => {
            for column in db::get_columns(&wh, &table, &schema, &Default::default()).await? {
                println!("{column}");
            }
        }
        DbCommand::Export {
            file,
            schema,
            table,
            bucket,
            dir,
            delete,
        } => {
            let defaults = &wh.config().warehouse;
            let mut target = ExportTarget::new()
                .s3(
                    bucket.unwrap_or_else(|| defaults.bucket.clone()),
                    dir.unwrap_or_else(|| defaults.bucket_dir.clone()),
                )
                .delete_file_after(delete);
            target.schema = schema;
            target.table = table;

            let name = wh.config().export.worker_name.clone();
            let mut exporter = QueueExporter::start(Arc::new(wh), name);
            exporter.export_file(file, target)?;
            exporter.close();
            exporter.join().await?;
        }
    }
    Ok(())
}
