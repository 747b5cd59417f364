use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputKey {
    pub(crate) global_name: u32,
    pub(crate) name_hash: u64,
}

impl OutputKey {
    pub(crate) fn from_name(global_name: u32, name: &str) -> Self {
        Self {
            global_name,
            name_hash: fnv1a_64(name.as_bytes()),
        }
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0001_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A display output a capture session can bind to.
///
/// `global_name` is the compositor's numeric handle for the output; `name`
/// is the connector name such as `HDMI-A-1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputId {
    key: OutputKey,

    name: String,

    width: u32,

    height: u32,
}

impl OutputId {
    pub fn new(global_name: u32, name: impl Into<String>, width: u32, height: u32) -> Self {
        let name = name.into();
        Self {
            key: OutputKey::from_name(global_name, &name),
            name,
            width,
            height,
        }
    }

    pub fn global_name(&self) -> u32 {
        self.key.global_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mode size advertised when the output was enumerated. Captured frames
    /// may differ after a mode change.
    pub fn mode_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn stable_id(&self) -> String {
        format!("{:08x}-{:016x}", self.key.global_name, self.key.name_hash)
    }

    pub fn key(&self) -> OutputKey {
        self.key
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_global_name_and_connector() {
        let a = OutputId::new(1, "HDMI-A-1", 1920, 1080);
        let b = OutputId::new(1, "DP-1", 1920, 1080);
        let c = OutputId::new(2, "HDMI-A-1", 1920, 1080);

        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key(), OutputId::new(1, "HDMI-A-1", 800, 600).key());
        assert_eq!(a.stable_id().len(), 8 + 1 + 16);
    }
}
