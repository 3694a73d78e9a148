//! Galois Field GF(256) arithmetic
//!
//! Uses the AES reduction polynomial x^8 + x^4 + x^3 + x + 1 (0x11B) with
//! generator 0x03. The log/exp tables are built at compile time.

const REDUCTION: u8 = 0x1B;
const GENERATOR_ORDER: usize = 255;

struct Tables {
    log: [u8; 256],
    /// Doubled so `exp[log a + log b]` never needs a modulo
    exp: [u8; 2 * GENERATOR_ORDER],
}

/// Multiply by 3 (the generator): `x * 2 + x`
const fn times_generator(x: u8) -> u8 {
    let doubled = if x & 0x80 != 0 {
        (x << 1) ^ REDUCTION
    } else {
        x << 1
    };
    doubled ^ x
}

const fn build_tables() -> Tables {
    let mut log = [0u8; 256];
    let mut exp = [0u8; 2 * GENERATOR_ORDER];
    let mut x: u8 = 1;
    let mut i = 0;
    while i < GENERATOR_ORDER {
        exp[i] = x;
        exp[i + GENERATOR_ORDER] = x;
        log[x as usize] = i as u8;
        x = times_generator(x);
        i += 1;
    }
    Tables { log, exp }
}

static TABLES: Tables = build_tables();

/// Addition and subtraction are both XOR in characteristic 2
#[inline]
pub fn gf_add(a: u8, b: u8) -> u8 {
    a ^ b
}

#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let idx = TABLES.log[a as usize] as usize + TABLES.log[b as usize] as usize;
    TABLES.exp[idx]
}

/// Divide `a` by `b`. Panics on `b == 0`; callers guarantee distinct,
/// non-zero evaluation points.
#[inline]
pub fn gf_div(a: u8, b: u8) -> u8 {
    assert!(b != 0, "division by zero in GF(256)");
    if a == 0 {
        return 0;
    }
    let idx = TABLES.log[a as usize] as usize + GENERATOR_ORDER - TABLES.log[b as usize] as usize;
    TABLES.exp[idx]
}

/// Evaluate `coefficients[0] + coefficients[1]*x + ...` with Horner's rule
pub fn poly_eval(coefficients: &[u8], x: u8) -> u8 {
    coefficients
        .iter()
        .rev()
        .fold(0u8, |acc, &c| gf_add(gf_mul(acc, x), c))
}

/// Lagrange interpolation at x = 0.
///
/// `points` must have distinct, non-zero x coordinates.
pub fn interpolate_at_zero(points: &[(u8, u8)]) -> u8 {
    let mut acc = 0u8;
    for (i, &(xi, yi)) in points.iter().enumerate() {
        let mut num = 1u8;
        let mut den = 1u8;
        for (j, &(xj, _)) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            // (0 - xj) == xj here
            num = gf_mul(num, xj);
            den = gf_mul(den, gf_add(xi, xj));
        }
        acc = gf_add(acc, gf_mul(yi, gf_div(num, den)));
    }
    acc
}
