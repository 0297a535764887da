use core::fmt;

use super::GeneralRegisters;

/// The registers a handler changed while servicing one exit.
pub struct GeneralRegistersDiff {
    old: GeneralRegisters,
    new: GeneralRegisters,
}

impl GeneralRegistersDiff {
    pub fn new(old: GeneralRegisters, new: GeneralRegisters) -> Self {
        Self { old, new }
    }

    pub fn is_same(&self) -> bool {
        self.old == self.new
    }

    /// `(index, old, new)` of every register that differs. The unused
    /// RSP slot never shows up.
    pub fn changes(&self) -> impl Iterator<Item = (u8, u64, u64)> + '_ {
        (0..16u8)
            .filter(|&i| i != 4)
            .map(|i| (i, self.old.get_reg_of_index(i), self.new.get_reg_of_index(i)))
            .filter(|(_, old, new)| old != new)
    }

    pub fn changed(&self) -> usize {
        self.changes().count()
    }
}

impl fmt::Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut map = f.debug_map();
        for (i, old, new) in self.changes() {
            map.key(&GeneralRegisters::register_name(i))
                .value(&format_args!("{old:#x} -> {new:#x}"));
        }
        map.finish()
    }
}
