// cvar.rs: named configuration variables
//
// Every tunable of the viewer is a cvar: a name, a string value and the
// float parse of that string. Defaults are registered at startup, then the
// command line overrides them with `+set <name> <value>` pairs.

use bitflags::bitflags;
use std::collections::HashMap;
use thiserror::Error;

bitflags! {
    /// Cvar behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CvarFlags: u32 {
        /// Value cannot be changed by `set`, only by `force_set`.
        const NOSET = 1 << 0;
        /// Value only takes effect after a restart of the viewer.
        const LATCH = 1 << 1;
    }
}

/// A configuration variable.
#[derive(Debug, Clone)]
pub struct Cvar {
    pub name: String,
    pub string: String,
    pub latched_string: Option<String>,
    pub flags: CvarFlags,
    pub modified: bool,
    pub value: f32,
}

/// Errors produced while applying command-line arguments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CvarError {
    #[error("unknown command line token `{0}` (expected `+set <name> <value>`)")]
    UnknownToken(String),
    #[error("`+set` needs a name and a value")]
    MissingArgument,
    #[error("{0} is write protected")]
    WriteProtected(String),
}

/// The cvar table.
#[derive(Debug, Default)]
pub struct CvarContext {
    cvar_vars: Vec<Cvar>,
    /// O(1) lookup by name -> index in cvar_vars
    cvar_index: HashMap<String, usize>,
}

impl CvarContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a cvar by name.
    pub fn find_var(&self, name: &str) -> Option<&Cvar> {
        self.cvar_index.get(name).map(|&idx| &self.cvar_vars[idx])
    }

    /// Get the floating-point value of a cvar. Returns 0 if not found.
    pub fn variable_value(&self, name: &str) -> f32 {
        self.find_var(name).map_or(0.0, |var| var.value)
    }

    /// Get the string value of a cvar. Returns "" if not found.
    pub fn variable_string(&self, name: &str) -> &str {
        self.find_var(name).map_or("", |var| var.string.as_str())
    }

    /// Get or create a cvar. An existing cvar keeps its value; flags are OR'd in.
    pub fn get(&mut self, name: &str, value: &str, flags: CvarFlags) -> usize {
        if let Some(&idx) = self.cvar_index.get(name) {
            self.cvar_vars[idx].flags |= flags;
            return idx;
        }

        let idx = self.cvar_vars.len();
        self.cvar_vars.push(Cvar {
            name: name.to_string(),
            string: value.to_string(),
            latched_string: None,
            flags,
            modified: true,
            value: parse_value(value),
        });
        self.cvar_index.insert(name.to_string(), idx);
        idx
    }

    /// Set a cvar, honouring NOSET and LATCH.
    pub fn set(&mut self, name: &str, value: &str) -> Result<usize, CvarError> {
        let idx = match self.cvar_index.get(name) {
            Some(&idx) => idx,
            None => return Ok(self.get(name, value, CvarFlags::empty())),
        };

        let var = &mut self.cvar_vars[idx];
        if var.flags.contains(CvarFlags::NOSET) {
            return Err(CvarError::WriteProtected(name.to_string()));
        }
        if var.flags.contains(CvarFlags::LATCH) {
            if var.string != value {
                log::info!("{} will be changed after a restart", name);
                var.latched_string = Some(value.to_string());
            }
            return Ok(idx);
        }

        Self::assign(var, value);
        Ok(idx)
    }

    /// Set a cvar regardless of its flags.
    pub fn force_set(&mut self, name: &str, value: &str) -> usize {
        let idx = self.get(name, value, CvarFlags::empty());
        Self::assign(&mut self.cvar_vars[idx], value);
        idx
    }

    fn assign(var: &mut Cvar, value: &str) {
        if var.string != value {
            var.modified = true;
            var.string = value.to_string();
            var.value = parse_value(value);
        }
        var.latched_string = None;
    }

    /// Set a cvar from a float.
    pub fn set_value(&mut self, name: &str, value: f32) -> Result<usize, CvarError> {
        let text = if value == value.trunc() {
            format!("{}", value as i64)
        } else {
            format!("{}", value)
        };
        self.set(name, &text)
    }

    /// Apply latched values. Called once at startup, before anything reads them.
    pub fn get_latched_vars(&mut self) {
        for var in &mut self.cvar_vars {
            if let Some(latched) = var.latched_string.take() {
                var.value = parse_value(&latched);
                var.string = latched;
                var.modified = true;
            }
        }
    }

    /// Return the names of modified cvars and clear their modified flag.
    pub fn check_modified(&mut self) -> Vec<String> {
        self.cvar_vars
            .iter_mut()
            .filter(|v| v.modified)
            .map(|v| {
                v.modified = false;
                v.name.clone()
            })
            .collect()
    }

    /// Apply `+set <name> <value>` pairs from the command line.
    ///
    /// The program name must already be stripped from `args`.
    pub fn apply_command_line<I, S>(&mut self, args: I) -> Result<(), CvarError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_ref() {
                "+set" => {
                    let (name, value) = match (args.get(i + 1), args.get(i + 2)) {
                        (Some(n), Some(v)) => (n.as_ref(), v.as_ref()),
                        _ => return Err(CvarError::MissingArgument),
                    };
                    // Command line runs before startup, so latched vars take effect now.
                    self.set(name, value)?;
                    i += 3;
                }
                other => return Err(CvarError::UnknownToken(other.to_string())),
            }
        }
        self.get_latched_vars();
        Ok(())
    }

    /// Iterate over all registered cvars in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Cvar> {
        self.cvar_vars.iter()
    }
}

fn parse_value(value: &str) -> f32 {
    value.trim().parse::<f32>().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cvar_get_and_find() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "42", CvarFlags::empty());
        assert_eq!(ctx.variable_value("test_var"), 42.0);
        assert_eq!(ctx.variable_string("test_var"), "42");
    }

    #[test]
    fn test_cvar_get_keeps_existing_value() {
        let mut ctx = CvarContext::new();
        ctx.get("vid_width", "800", CvarFlags::empty());
        ctx.get("vid_width", "1024", CvarFlags::empty());
        assert_eq!(ctx.variable_value("vid_width"), 800.0);
    }

    #[test]
    fn test_cvar_set() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "10", CvarFlags::empty());
        ctx.set("test_var", "20").unwrap();
        assert_eq!(ctx.variable_value("test_var"), 20.0);
    }

    #[test]
    fn test_cvar_noset() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "10", CvarFlags::NOSET);
        assert_eq!(
            ctx.set("test_var", "20"),
            Err(CvarError::WriteProtected("test_var".into()))
        );
        assert_eq!(ctx.variable_value("test_var"), 10.0);
    }

    #[test]
    fn test_cvar_force_set() {
        let mut ctx = CvarContext::new();
        ctx.get("test_var", "10", CvarFlags::NOSET);
        ctx.force_set("test_var", "20");
        assert_eq!(ctx.variable_value("test_var"), 20.0);
    }

    #[test]
    fn test_cvar_latch() {
        let mut ctx = CvarContext::new();
        ctx.get("r_validation", "0", CvarFlags::LATCH);
        ctx.set("r_validation", "1").unwrap();
        assert_eq!(ctx.variable_value("r_validation"), 0.0);
        ctx.get_latched_vars();
        assert_eq!(ctx.variable_value("r_validation"), 1.0);
    }

    #[test]
    fn test_cvar_set_value() {
        let mut ctx = CvarContext::new();
        ctx.get("m_sensitivity", "0", CvarFlags::empty());
        ctx.set_value("m_sensitivity", 0.25).unwrap();
        assert!((ctx.variable_value("m_sensitivity") - 0.25).abs() < 0.001);
        ctx.set_value("m_sensitivity", 3.0).unwrap();
        assert_eq!(ctx.variable_string("m_sensitivity"), "3");
    }

    #[test]
    fn test_cvar_not_found() {
        let ctx = CvarContext::new();
        assert_eq!(ctx.variable_value("nonexistent"), 0.0);
        assert_eq!(ctx.variable_string("nonexistent"), "");
    }

    #[test]
    fn test_command_line() {
        let mut ctx = CvarContext::new();
        ctx.get("vid_width", "800", CvarFlags::empty());
        ctx.get("r_validation", "0", CvarFlags::LATCH);
        ctx.apply_command_line(["+set", "vid_width", "1280", "+set", "r_validation", "1"])
            .unwrap();
        assert_eq!(ctx.variable_value("vid_width"), 1280.0);
        assert_eq!(ctx.variable_value("r_validation"), 1.0);
    }

    #[test]
    fn test_command_line_errors() {
        let mut ctx = CvarContext::new();
        assert_eq!(
            ctx.apply_command_line(["+set", "vid_width"]),
            Err(CvarError::MissingArgument)
        );
        assert_eq!(
            ctx.apply_command_line(["--fullscreen"]),
            Err(CvarError::UnknownToken("--fullscreen".into()))
        );
    }

    #[test]
    fn test_check_modified_clears_flag() {
        let mut ctx = CvarContext::new();
        ctx.get("a", "1", CvarFlags::empty());
        assert_eq!(ctx.check_modified(), vec!["a".to_string()]);
        assert!(ctx.check_modified().is_empty());
        ctx.set("a", "2").unwrap();
        assert_eq!(ctx.check_modified(), vec!["a".to_string()]);
    }
}
