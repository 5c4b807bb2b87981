use anyhow::{Context, Result};

const CONFIG_TEMPLATE: &str = include_str!("../../templates/config-template.toml");

/// Generate configuration template
pub fn generate_config_template(output: Option<&str>) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated configuration template: {}", path);
    } else {
        println!("{}", CONFIG_TEMPLATE);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_template_is_valid_config() {
        let config: AppConfig = toml::from_str(CONFIG_TEMPLATE).unwrap();
        config.validate().unwrap();
        assert!(!config.accounts.is_empty());
    }
}
