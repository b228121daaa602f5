use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};

use doctrans::batch::{self, BatchRequest, CancellationToken};
use doctrans::config::JobConfig;
use doctrans::merge::MultiTableCollection;
use doctrans::{dataset, placeholder};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Dry run mode - don't write files
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project with an example config
    Init {
        /// Project directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// List the placeholder tokens found in a template
    Scan {
        /// A .docx or .xlsx template file
        template: PathBuf,
    },
    /// Generate one document per data row (default command)
    Generate,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { path }) => {
            init_project(&path)?;
        }
        Some(Commands::Scan { template }) => {
            scan_template(&template)?;
        }
        Some(Commands::Generate) | None => {
            generate(cli)?;
        }
    }

    Ok(())
}

fn init_project(path: &Path) -> Result<()> {
    info!("Initializing project at {:?}", path);

    std::fs::create_dir_all(path.join("output"))?;

    let config_content = r#"data:
  files:
    - people.xlsx
  multi_table: false
  # key_column: 姓名

output_dir: output

doc_template: letter.docx
# sheet_template: card.xlsx

output_name_template: "{序号}_{姓名}_{时间}"

images:
  enabled: false
  fill_mode: fit
  fill_percentage: 90
  directories: []
  #  - path: photos
  #    matching_column: 姓名

id_extraction:
  enabled: false
  # column: 身份证号
"#;
    std::fs::write(path.join("config.yaml"), config_content)?;

    info!("✓ Project initialized successfully!");
    info!("  Run: doctrans -c config.yaml");

    Ok(())
}

fn scan_template(template: &Path) -> Result<()> {
    let extension = template
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    let tokens = match extension.as_str() {
        "docx" => placeholder::scan_document(template).context("Failed to scan template")?,
        _ => placeholder::scan_workbook(template).context("Failed to scan template")?,
    };

    if tokens.is_empty() {
        info!("no placeholder tokens found in {:?}", template);
    }
    for token in tokens {
        println!("{{{}}}", token);
    }
    Ok(())
}

fn generate(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .ok_or_else(|| anyhow::anyhow!("--config is required"))?;

    info!("Loading config from {:?}", config_path);
    let config = JobConfig::load(&config_path).context("Failed to load config")?;

    let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let resolve = |p: &Path| if p.is_absolute() { p.to_path_buf() } else { base.join(p) };

    let rows = load_rows(&config, &resolve)?;
    info!("{} data rows loaded", rows.len());

    if cli.dry_run {
        info!("=== DRY RUN MODE ===");
    }

    let request = BatchRequest {
        rows: rows.clone(),
        output_dir: resolve(&config.output_dir),
        doc_template: config.doc_template.as_deref().map(&resolve),
        sheet_template: config.sheet_template.as_deref().map(&resolve),
        output_name_template: config.output_name_template.clone(),
        doc_options: config.doc_options(rows),
        sheet_options: config.sheet_options(),
        use_images: config.images.enabled,
        image_dirs: config
            .images
            .directories
            .iter()
            .cloned()
            .map(|mut dir| {
                dir.path = resolve(&dir.path);
                dir
            })
            .collect(),
        id_source_column: if config.id_extraction.enabled {
            config.id_extraction.column.clone()
        } else {
            None
        },
        dry_run: cli.dry_run,
    };

    let summary = batch::run(&request, &CancellationToken::new(), |processed, total| {
        info!("progress: {}/{}", processed, total);
    })?;

    info!(
        "{} succeeded, {} failed",
        summary.success_count, summary.failure_count
    );
    if !summary.is_success() {
        anyhow::bail!("{} render(s) failed", summary.failure_count);
    }

    if cli.dry_run {
        info!("=== DRY RUN COMPLETE ===");
    }

    Ok(())
}

fn load_rows(
    config: &JobConfig,
    resolve: &impl Fn(&Path) -> PathBuf,
) -> Result<Vec<std::collections::HashMap<String, String>>> {
    if config.data.multi_table {
        let key = config
            .data
            .key_column
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("multi_table requires data.key_column"))?;

        let mut collection = MultiTableCollection::new();
        for file in &config.data.files {
            let path = resolve(file);
            for table in
                dataset::read_all_sheets(&path).with_context(|| format!("reading {:?}", path))?
            {
                info!("loaded '{}' ({} rows)", table.source_label, table.row_count());
                collection.add_table(table);
            }
        }
        if !collection.common_headers().iter().any(|h| h == key) {
            warn!("'{}' is not a common header of all tables", key);
        }
        let merged = collection.merge(key);
        info!("merged into {} rows on '{}'", merged, key);
        Ok(collection.merged_rows().to_vec())
    } else {
        let file = config
            .data
            .files
            .first()
            .ok_or_else(|| anyhow::anyhow!("data.files must not be empty"))?;
        let path = resolve(file);
        let table =
            dataset::read_first_sheet(&path).with_context(|| format!("reading {:?}", path))?;
        info!("loaded '{}' ({} rows)", table.source_label, table.row_count());
        Ok(table.rows)
    }
}
