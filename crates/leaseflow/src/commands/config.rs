use colored::Colorize;

pub fn handle(path_only: bool) -> anyhow::Result<()> {
    let path = leaseflow_config::find_config_file()?;

    if path_only {
        match path {
            Some(path) => println!("{}", path.display()),
            None => {
                eprintln!(
                    "{}",
                    "設定ファイルは見つかりません（デフォルト値と環境変数のみ）".yellow()
                );
            }
        }
        return Ok(());
    }

    let settings = leaseflow_config::load_from(path.as_deref())?;
    match &path {
        Some(path) => eprintln!("# {}", path.display()),
        None => eprintln!("# (設定ファイルなし)"),
    }
    print!("{}", leaseflow_config::render(&settings)?);
    Ok(())
}
