// belt_probe/src/configfile.rs
// Reads printer configuration and keeps track of pending autosave changes.

use std::collections::BTreeMap;
use std::collections::HashMap;

use log::info;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Section not found: [{0}]")]
    SectionNotFound(String),
    #[error("Option '{1}' not found in section '[{0}]'")]
    OptionNotFound(String, String),
    #[error("Failed to parse option '{0}' value '{1}' as {2}")]
    ParseError(String, String, String), // option, value, type_expected
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Syntax error: {0}")]
    Syntax(String),
}

/// Storage for calibrated values that should end up in the printer config.
pub trait ConfigStore {
    fn set(&mut self, section: &str, option: &str, value: &str);
}

#[derive(Debug, Default, Clone)]
pub struct Configfile {
    // section_name -> { option_name -> raw value }, names stored lowercase
    data: HashMap<String, HashMap<String, String>>,
    filename: Option<String>,
    // Changes requested at runtime, written out by SAVE_CONFIG
    autosave: BTreeMap<String, BTreeMap<String, String>>,
}

impl Configfile {
    pub fn new(filename: Option<String>) -> Self {
        Configfile {
            data: HashMap::new(),
            filename,
            autosave: BTreeMap::new(),
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Parses an INI-style configuration string.
    pub fn parse(&mut self, config_content: &str) -> Result<(), ConfigError> {
        self.data.clear();
        let mut current_section_name: Option<String> = None;

        for line_raw in config_content.lines() {
            let line_no_comment = match line_raw.find(|c| c == '#' || c == ';') {
                Some(index) => &line_raw[..index],
                None => line_raw,
            };
            let line = line_no_comment.trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let section_name = line[1..line.len() - 1].trim().to_lowercase();
                if section_name.is_empty() {
                    return Err(ConfigError::Syntax("Empty section name found".to_string()));
                }
                self.data.entry(section_name.clone()).or_default();
                current_section_name = Some(section_name);
                continue;
            }

            let section_name = current_section_name
                .as_ref()
                .ok_or_else(|| ConfigError::Syntax(format!("Line outside of section: {}", line_raw)))?;

            // Both "key = value" and "key: value" are accepted; whichever separator comes first wins
            let split_at = line.find(|c| c == '=' || c == ':').ok_or_else(|| {
                ConfigError::Syntax(format!("Malformed line in section [{}]: {}", section_name, line_raw))
            })?;
            let key = line[..split_at].trim().to_lowercase();
            let value = line[split_at + 1..].trim().to_string();
            if key.is_empty() {
                return Err(ConfigError::Syntax(format!("Empty key found in section [{}]", section_name)));
            }
            self.data.entry(section_name.clone()).or_default().insert(key, value);
        }
        Ok(())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.data.contains_key(&section.to_lowercase())
    }

    pub fn get_str(&self, section: &str, option: &str) -> Result<&String, ConfigError> {
        self.data
            .get(&section.to_lowercase())
            .ok_or_else(|| ConfigError::SectionNotFound(section.to_string()))?
            .get(&option.to_lowercase())
            .ok_or_else(|| ConfigError::OptionNotFound(section.to_string(), option.to_string()))
    }

    // Looks up a raw value, falling back to `default` only when the option itself is missing
    fn lookup<T>(
        &self,
        section: &str,
        option: &str,
        default: Option<T>,
        convert: impl FnOnce(&String) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        match self.get_str(section, option) {
            Ok(raw) => convert(raw),
            Err(ConfigError::OptionNotFound(_, _)) => default.ok_or_else(|| {
                ConfigError::OptionNotFound(section.to_string(), option.to_string())
            }),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, section: &str, option: &str, default: Option<&str>) -> Result<String, ConfigError> {
        self.lookup(section, option, default.map(str::to_string), |raw| Ok(raw.clone()))
    }

    pub fn getfloat(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        minval: Option<f64>,
        maxval: Option<f64>,
    ) -> Result<f64, ConfigError> {
        let value = self.lookup(section, option, default, |raw| {
            raw.parse::<f64>()
                .map_err(|_| ConfigError::ParseError(option.to_string(), raw.clone(), "float".to_string()))
        })?;
        if let Some(min) = minval {
            if value < min {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be >= {}",
                    option, section, value, min
                )));
            }
        }
        if let Some(max) = maxval {
            if value > max {
                return Err(ConfigError::ValidationError(format!(
                    "Option '{}' in section '[{}]' ({}) must be <= {}",
                    option, section, value, max
                )));
            }
        }
        Ok(value)
    }

    /// Like `getfloat` but the value must be strictly greater than `above`.
    pub fn getfloat_above(
        &self,
        section: &str,
        option: &str,
        default: Option<f64>,
        above: f64,
    ) -> Result<f64, ConfigError> {
        let value = self.getfloat(section, option, default, None, None)?;
        if value <= above {
            return Err(ConfigError::ValidationError(format!(
                "Option '{}' in section '[{}]' ({}) must be above {}",
                option, section, value, above
            )));
        }
        Ok(value)
    }

    /// Optional float: missing option yields `None` instead of an error.
    pub fn getfloat_opt(&self, section: &str, option: &str) -> Result<Option<f64>, ConfigError> {
        match self.getfloat(section, option, None, None, None) {
            Ok(v) => Ok(Some(v)),
            Err(ConfigError::OptionNotFound(_, _)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn getchoice(
        &self,
        section: &str,
        option: &str,
        choices: &[&str],
        default: Option<&str>,
    ) -> Result<String, ConfigError> {
        let value = self.get(section, option, default)?;
        if !choices.iter().any(|c| c.eq_ignore_ascii_case(&value)) {
            return Err(ConfigError::ValidationError(format!(
                "Choice '{}' for option '{}' in section '[{}]' is not a valid choice",
                value, option, section
            )));
        }
        Ok(value.to_lowercase())
    }

    /// Changes queued for SAVE_CONFIG, grouped by section.
    pub fn pending_changes(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.autosave
    }

    /// Renders the pending changes as config text.
    pub fn render_autosave(&self) -> String {
        let mut out = String::new();
        for (section, options) in &self.autosave {
            out.push_str(&format!("[{}]\n", section));
            for (option, value) in options {
                out.push_str(&format!("{} = {}\n", option, value));
            }
            out.push('\n');
        }
        out
    }

    #[cfg(test)]
    pub fn set_option(&mut self, section: &str, option: &str, value: &str) {
        self.data
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }
}

impl ConfigStore for Configfile {
    fn set(&mut self, section: &str, option: &str, value: &str) {
        info!("save_config: set [{}] {} = {}", section, option, value);
        self.autosave
            .entry(section.to_lowercase())
            .or_default()
            .insert(option.to_lowercase(), value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_parsed_config(content: &str) -> Configfile {
        let mut cf = Configfile::new(None);
        cf.parse(content).unwrap();
        cf
    }

    #[test]
    fn test_parse_simple_config() {
        let content = "[section1]\nkey1 = value1\nkey2:value2\n\n[section2]\nkeyA=valueA";
        let cf = create_parsed_config(content);

        assert_eq!(cf.get("section1", "key1", None).unwrap(), "value1");
        assert_eq!(cf.get("section1", "KEY2", None).unwrap(), "value2");
        assert_eq!(cf.get("SECTION2", "keya", None).unwrap(), "valueA");
    }

    #[test]
    fn test_parse_with_comments_and_whitespace() {
        let content = r#"
# This is a full line comment
[stepper_y] ; another comment style
  position_endstop = 12.5 # trailing comment
  step_distance:    0.0125
  ; position_max = 300
"#;
        let cf = create_parsed_config(content);
        assert_eq!(cf.getfloat("stepper_y", "position_endstop", None, None, None).unwrap(), 12.5);
        assert_eq!(cf.getfloat("stepper_y", "step_distance", None, None, None).unwrap(), 0.0125);
        assert!(cf.get("stepper_y", "position_max", None).is_err());
    }

    #[test]
    fn test_getters_with_types_and_defaults() {
        let content = "[types]\nmyfloat = 2.5\nnotfloat = fast";
        let cf = create_parsed_config(content);

        assert_eq!(cf.getfloat("types", "myfloat", None, None, None).unwrap(), 2.5);
        assert!(matches!(
            cf.getfloat("types", "notfloat", Some(1.0), None, None),
            Err(ConfigError::ParseError(..))
        ));

        assert_eq!(cf.get("types", "nonexistent", Some("default_val")).unwrap(), "default_val");
        assert_eq!(cf.getfloat("types", "nonexistent_float", Some(1.23), None, None).unwrap(), 1.23);

        assert!(cf.get("types", "required_missing", None).is_err());
        assert!(cf.getfloat("types", "required_float_missing", None, None, None).is_err());
    }

    #[test]
    fn test_missing_section_is_not_defaulted() {
        let cf = create_parsed_config("[printer]\nkinematics: belt");
        assert_eq!(
            cf.getfloat("belt_probe", "speed", Some(5.0), None, None),
            Err(ConfigError::SectionNotFound("belt_probe".to_string()))
        );
    }

    #[test]
    fn test_getfloat_with_validation() {
        let cf = create_parsed_config("[validation]\nval = 10.0");
        assert_eq!(cf.getfloat("validation", "val", None, Some(0.0), Some(20.0)).unwrap(), 10.0);

        match cf.getfloat("validation", "val", None, Some(15.0), Some(20.0)) {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("must be >= 15")),
            other => panic!("Expected ValidationError for minval, got {:?}", other),
        }
        match cf.getfloat("validation", "val", None, Some(0.0), Some(5.0)) {
            Err(ConfigError::ValidationError(msg)) => assert!(msg.contains("must be <= 5")),
            other => panic!("Expected ValidationError for maxval, got {:?}", other),
        }
        assert!(cf.getfloat_above("validation", "val", None, 10.0).is_err());
        assert_eq!(cf.getfloat_above("validation", "val", None, 0.0).unwrap(), 10.0);
    }

    #[test]
    fn test_getfloat_opt() {
        let cf = create_parsed_config("[stepper_y]\nposition_endstop = 3\nbad = x");
        assert_eq!(cf.getfloat_opt("stepper_y", "position_endstop").unwrap(), Some(3.0));
        assert_eq!(cf.getfloat_opt("stepper_y", "position_min").unwrap(), None);
        assert!(cf.getfloat_opt("stepper_y", "bad").is_err());
    }

    #[test]
    fn test_getchoice() {
        let cf = create_parsed_config("[printer]\nkinematics: Belt");
        assert_eq!(cf.getchoice("printer", "kinematics", &["belt", "cartesian"], None).unwrap(), "belt");
        assert!(cf.getchoice("printer", "kinematics", &["cartesian"], None).is_err());
    }

    #[test]
    fn test_parse_errors() {
        let mut cf = Configfile::new(None);
        assert!(cf.parse("[]\nkey=val").is_err());
        assert!(cf.parse("[sec]\n=val").is_err());
        assert!(cf.parse("[sec]\njustavalue").is_err());
        assert!(cf.parse("key=val").is_err());
    }

    #[test]
    fn test_autosave_records_changes() {
        let mut cf = Configfile::new(None);
        cf.set("stepper_y", "position_endstop", "1.250");
        cf.set("Stepper_Y", "position_endstop", "1.500");
        assert_eq!(cf.pending_changes()["stepper_y"]["position_endstop"], "1.500");
        assert_eq!(cf.render_autosave(), "[stepper_y]\nposition_endstop = 1.500\n\n");
    }
}
