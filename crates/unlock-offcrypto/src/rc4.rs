/// RC4 stream cipher (KSA + PRGA), as used by legacy binary-format encryption.
pub(crate) struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Key schedule for `key`. An empty key leaves the identity permutation.
    pub(crate) fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        if key.is_empty() {
            return Rc4 { s, i: 0, j: 0 };
        }
        let mut j: u8 = 0;
        for i in 0..256usize {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Rc4 { s, i: 0, j: 0 }
    }

    pub(crate) fn apply_keystream(&mut self, data: &mut [u8]) {
        for b in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *b ^= self.s[idx as usize];
        }
    }

    /// Advance the keystream by `n` bytes without using them.
    pub(crate) fn skip(&mut self, mut n: usize) {
        let mut scratch = [0u8; 64];
        while n > 0 {
            let step = n.min(scratch.len());
            self.apply_keystream(&mut scratch[..step]);
            n -= step;
        }
    }
}
