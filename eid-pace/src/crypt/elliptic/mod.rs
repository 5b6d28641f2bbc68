//! Elliptic-curve cryptography over prime fields.
//!
//! Curves have the short Weierstrass form `y**2 ≡ x**3 + ax + b (mod p)`. Arithmetic is performed
//! in projective coordinates in Montgomery form using the complete formulas of Renes, Costello and
//! Batina, so the point at infinity needs no special treatment.


pub mod curves;


use std::fmt;
use std::ops::{Add, Mul};

use crypto_bigint::{BoxedUint, ConstantTimeSelect, Odd};
use crypto_bigint::modular::{BoxedMontyForm, BoxedMontyParams};
use subtle::{Choice, ConstantTimeEq};
use zeroize::Zeroizing;
use zeroize_derive::{Zeroize, ZeroizeOnDrop};

use crate::crypt::{boxed_uint_from_be_slice, boxed_uint_to_be_bytes, boxed_uint_with_precision};


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// The point does not lie on the curve or its encoding is invalid.
    InvalidPoint,

    /// A key agreement produced the point at infinity.
    WeakKey,

    /// Nonce mapping produced an unusable generator.
    InvalidMapping,

    /// The curve does not support the requested operation.
    UnsupportedCurve,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPoint => write!(f, "point is not on the curve"),
            Self::WeakKey => write!(f, "key agreement resulted in the point at infinity"),
            Self::InvalidMapping => write!(f, "mapped generator is invalid"),
            Self::UnsupportedCurve => write!(f, "operation is not supported on this curve"),
        }
    }
}
impl std::error::Error for Error {
}


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Zeroize, ZeroizeOnDrop)]
pub struct AffinePoint {
    x: BoxedUint,
    y: BoxedUint,
}
impl AffinePoint {
    pub fn new(x: BoxedUint, y: BoxedUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BoxedUint { &self.x }
    pub fn y(&self) -> &BoxedUint { &self.y }

    /// Encodes the point in uncompressed form: `0x04 || x || y`, each coordinate taking up
    /// `bytes_per_component` bytes.
    pub fn to_be_bytes(&self, bytes_per_component: usize) -> Zeroizing<Vec<u8>> {
        let mut ret = Zeroizing::new(Vec::with_capacity(1 + 2*bytes_per_component));
        ret.push(0x04); // uncompressed coordinates
        ret.extend(boxed_uint_to_be_bytes(&self.x, bytes_per_component).iter());
        ret.extend(boxed_uint_to_be_bytes(&self.y, bytes_per_component).iter());
        ret
    }

    /// Decodes a point in uncompressed form.
    ///
    /// Only the structure is checked here; use [`PrimeWeierstrassCurve::decode_point`] to also
    /// verify that the point is on a specific curve.
    pub fn try_from_be_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 3 {
            // mode x y
            return Err(Error::InvalidPoint);
        }
        if bytes[0] != 0x04 {
            // we only support the uncompressed representation
            return Err(Error::InvalidPoint);
        }
        if (bytes.len() - 1) % 2 != 0 {
            // it must be possible to split the value in the middle
            return Err(Error::InvalidPoint);
        }
        let coordinate_length = (bytes.len() - 1) / 2;

        let x = boxed_uint_from_be_slice(&bytes[1..1+coordinate_length]);
        let y = boxed_uint_from_be_slice(&bytes[1+coordinate_length..]);
        Ok(Self { x, y })
    }
}


/// A point on a curve, which may be the point at infinity.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Point {
    Infinity,
    Affine(AffinePoint),
}
impl Point {
    pub fn is_infinity(&self) -> bool {
        matches!(self, Self::Infinity)
    }

    pub fn as_affine(&self) -> Option<&AffinePoint> {
        match self {
            Self::Infinity => None,
            Self::Affine(point) => Some(point),
        }
    }
}
impl From<AffinePoint> for Point {
    fn from(value: AffinePoint) -> Self { Self::Affine(value) }
}


/// A point in projective coordinates in Montgomery form.
#[derive(Clone, Debug, Eq, PartialEq)]
struct MontyProjectivePoint {
    x: BoxedMontyForm,
    y: BoxedMontyForm,
    z: BoxedMontyForm,
}
impl MontyProjectivePoint {
    /// Swaps the points if `choice` is set, touching every limb either way.
    fn conditional_swap(a: &mut Self, b: &mut Self, choice: Choice) {
        fn swap_coordinate(a: &mut BoxedMontyForm, b: &mut BoxedMontyForm, choice: Choice) {
            let mut a_limbs = a.as_montgomery().clone();
            let mut b_limbs = b.as_montgomery().clone();
            BoxedUint::ct_swap(&mut a_limbs, &mut b_limbs, choice);
            *a = BoxedMontyForm::from_montgomery(a_limbs, a.params().clone());
            *b = BoxedMontyForm::from_montgomery(b_limbs, b.params().clone());
        }

        swap_coordinate(&mut a.x, &mut b.x, choice);
        swap_coordinate(&mut a.y, &mut b.y, choice);
        swap_coordinate(&mut a.z, &mut b.z, choice);
    }
}

#[derive(Clone, Debug)]
struct MontyKnowledge {
    params: BoxedMontyParams,
    a: BoxedMontyForm,
    b: BoxedMontyForm,
    b3: BoxedMontyForm,
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
///
/// All stored integers share the precision of the prime.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, ZeroizeOnDrop)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BoxedUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BoxedUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BoxedUint,

    /// The coordinates of the generator point of the curve.
    generator: AffinePoint,

    /// The order of the subgroup generated by the generator.
    order: BoxedUint,

    /// The cofactor of the curve.
    ///
    /// A cofactor n means that only each nth point on the curve is part of the group.
    cofactor: u8,
}
impl PrimeWeierstrassCurve {
    /// Creates a curve from its domain parameters.
    ///
    /// # Panics
    ///
    /// Panics if the prime is even or the generator is not on the curve. Both indicate broken
    /// domain parameters.
    pub fn new(
        prime: BoxedUint,
        coefficient_a: BoxedUint,
        coefficient_b: BoxedUint,
        generator: AffinePoint,
        order: BoxedUint,
        cofactor: u8,
    ) -> Self {
        if !prime.bit_vartime(0) {
            panic!("prime is not odd");
        }

        let precision = prime.bits_precision();
        let curve = Self {
            coefficient_a: boxed_uint_with_precision(&coefficient_a, precision),
            coefficient_b: boxed_uint_with_precision(&coefficient_b, precision),
            generator: AffinePoint::new(
                boxed_uint_with_precision(generator.x(), precision),
                boxed_uint_with_precision(generator.y(), precision),
            ),
            order: boxed_uint_with_precision(&order, precision.max(order.bits_precision())),
            prime,
            cofactor,
        };
        if !bool::from(curve.is_on_curve_affine(&curve.generator)) {
            panic!("generator is not on curve");
        }
        curve
    }

    pub fn prime(&self) -> &BoxedUint { &self.prime }
    pub fn coefficient_a(&self) -> &BoxedUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BoxedUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn order(&self) -> &BoxedUint { &self.order }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// The number of bytes of an encoded coordinate (and of the ECDH shared secret).
    pub fn coordinate_len_bytes(&self) -> usize {
        usize::try_from(self.prime.bits().div_ceil(8)).unwrap_or(usize::MAX)
    }

    /// The number of bytes a private key used with this curve should have.
    pub fn private_key_len_bytes(&self) -> usize {
        usize::try_from(self.order.bits().div_ceil(8)).unwrap_or(usize::MAX)
    }

    /// Returns a copy of this curve with a different generator.
    ///
    /// The generator must lie on the curve and generate the subgroup of the original order.
    pub fn with_generator(&self, generator: AffinePoint) -> Result<Self, Error> {
        let generator = self.canonical_point(&generator)
            .ok_or(Error::InvalidPoint)?;
        if !bool::from(self.is_on_curve_affine(&generator)) {
            return Err(Error::InvalidPoint);
        }
        if !self.has_order(&generator)? {
            return Err(Error::InvalidMapping);
        }
        Ok(Self {
            prime: self.prime.clone(),
            coefficient_a: self.coefficient_a.clone(),
            coefficient_b: self.coefficient_b.clone(),
            generator,
            order: self.order.clone(),
            cofactor: self.cofactor,
        })
    }

    /// Decodes a point in uncompressed form and verifies that it lies on this curve.
    ///
    /// Each coordinate must be encoded in exactly [`Self::coordinate_len_bytes`] bytes and be
    /// smaller than the prime.
    pub fn decode_point(&self, bytes: &[u8]) -> Result<AffinePoint, Error> {
        if bytes.len() != 1 + 2*self.coordinate_len_bytes() {
            return Err(Error::InvalidPoint);
        }
        let point = AffinePoint::try_from_be_bytes(bytes)?;
        let point = self.canonical_point(&point)
            .ok_or(Error::InvalidPoint)?;
        if !bool::from(self.is_on_curve_affine(&point)) {
            return Err(Error::InvalidPoint);
        }
        Ok(point)
    }

    /// Encodes a point in uncompressed form with coordinates of [`Self::coordinate_len_bytes`]
    /// bytes.
    pub fn encode_point(&self, point: &AffinePoint) -> Zeroizing<Vec<u8>> {
        point.to_be_bytes(self.coordinate_len_bytes())
    }

    /// Brings an integer to the precision of the prime, failing if it is not a field element.
    fn canonical_field_element(&self, value: &BoxedUint) -> Option<BoxedUint> {
        if value.bits() > self.prime.bits() {
            return None;
        }
        let value = boxed_uint_with_precision(value, self.prime.bits_precision());
        if value >= self.prime {
            return None;
        }
        Some(value)
    }

    fn canonical_point(&self, point: &AffinePoint) -> Option<AffinePoint> {
        Some(AffinePoint::new(
            self.canonical_field_element(point.x())?,
            self.canonical_field_element(point.y())?,
        ))
    }

    /// Returns important curve parameters for operations in Montgomery form.
    fn monty_knowledge(&self) -> Result<MontyKnowledge, Error> {
        let odd_prime: Odd<BoxedUint> = Odd::new(self.prime.clone()).into_option()
            .ok_or(Error::UnsupportedCurve)?;
        let params = BoxedMontyParams::new(odd_prime);
        let a = BoxedMontyForm::new(self.coefficient_a.clone(), params.clone());
        let b = BoxedMontyForm::new(self.coefficient_b.clone(), params.clone());
        let b3 = (&b).add(&b).add(&b);
        Ok(MontyKnowledge { params, a, b, b3 })
    }

    fn internal_is_on_curve(monty: &MontyKnowledge, point: &MontyProjectivePoint) -> Choice {
        // Y**2 * Z = X**3 + a * X * Z**2 + b * Z**3
        // (also holds for the point at infinity (0 : 1 : 0))
        let z_squared = (&point.z).mul(&point.z);
        let lhs = (&point.y).mul(&point.y).mul(&point.z);
        let x_cubed = (&point.x).mul(&point.x).mul(&point.x);
        let axz2 = (&monty.a).mul(&point.x).mul(&z_squared);
        let bz3 = (&monty.b).mul(&z_squared).mul(&point.z);
        let rhs = (&x_cubed).add(&axz2).add(&bz3);
        lhs.retrieve().ct_eq(&rhs.retrieve())
    }

    fn internal_affine_to_monty_projective(monty: &MontyKnowledge, point: &AffinePoint) -> MontyProjectivePoint {
        let x = BoxedMontyForm::new(point.x.clone(), monty.params.clone());
        let y = BoxedMontyForm::new(point.y.clone(), monty.params.clone());
        let z = BoxedMontyForm::one(monty.params.clone());
        MontyProjectivePoint { x, y, z }
    }

    fn internal_point_to_monty_projective(monty: &MontyKnowledge, point: &Point) -> MontyProjectivePoint {
        match point {
            Point::Infinity => Self::internal_point_at_infinity(monty),
            Point::Affine(affine) => Self::internal_affine_to_monty_projective(monty, affine),
        }
    }

    fn internal_monty_projective_to_point(point: &MontyProjectivePoint) -> Point {
        let Some(inverse) = point.z.invert().into_option() else {
            // Z = 0
            return Point::Infinity;
        };

        let x = (&point.x).mul(&inverse);
        let y = (&point.y).mul(&inverse);
        Point::Affine(AffinePoint {
            x: x.retrieve(),
            y: y.retrieve(),
        })
    }

    fn internal_double_point(monty: &MontyKnowledge, point: &MontyProjectivePoint) -> MontyProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 3
        let b3 = &monty.b3;

        // 1. t0 ← X · X
        let mut t0 = (&point.x).mul(&point.x);
        // 2. t1 ← Y · Y
        let t1 = (&point.y).mul(&point.y);
        // 3. t2 ← Z · Z
        let mut t2 = (&point.z).mul(&point.z);
        // 4. t3 ← X · Y
        let mut t3 = (&point.x).mul(&point.y);
        // 5. t3 ← t3 + t3
        t3 = (&t3).add(&t3);
        // 6. Z3 ← X · Z
        let mut z3 = (&point.x).mul(&point.z);
        // 7. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        // 8. X3 ← a · Z3
        let mut x3 = (&monty.a).mul(&z3);
        // 9. Y3 ← b3 · t2
        let mut y3 = b3.mul(&t2);
        // 10. Y3 ← X3 + Y3
        y3 = (&x3).add(&y3);
        // 11. X3 ← t1 − Y3
        x3 = (&t1).sub(&y3);
        // 12. Y3 ← t1 + Y3
        y3 = (&t1).add(&y3);
        // 13. Y3 ← X3 · Y3
        y3 = (&x3).mul(&y3);
        // 14. X3 ← t3 · X3
        x3 = (&t3).mul(&x3);
        // 15. Z3 ← b3 · Z3
        z3 = b3.mul(&z3);
        // 16. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 17. t3 ← t0 − t2
        t3 = (&t0).sub(&t2);
        // 18. t3 ← a · t3
        t3 = (&monty.a).mul(&t3);
        // 19. t3 ← t3 + Z3
        t3 = (&t3).add(&z3);
        // 20. Z3 ← t0 + t0
        z3 = (&t0).add(&t0);
        // 21. t0 ← Z3 + t0
        t0 = (&z3).add(&t0);
        // 22. t0 ← t0 + t2
        t0 = (&t0).add(&t2);
        // 23. t0 ← t0 · t3
        t0 = (&t0).mul(&t3);
        // 24. Y3 ← Y3 + t0
        y3 = (&y3).add(&t0);
        // 25. t2 ← Y · Z
        t2 = (&point.y).mul(&point.z);
        // 26. t2 ← t2 + t2
        t2 = (&t2).add(&t2);
        // 27. t0 ← t2 · t3
        t0 = (&t2).mul(&t3);
        // 28. X3 ← X3 − t0
        x3 = (&x3).sub(&t0);
        // 29. Z3 ← t2 · t1
        z3 = (&t2).mul(&t1);
        // 30. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        // 31. Z3 ← Z3 + Z3
        z3 = (&z3).add(&z3);
        MontyProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_add_points(monty: &MontyKnowledge, lhs: &MontyProjectivePoint, rhs: &MontyProjectivePoint) -> MontyProjectivePoint {
        // Renes/Costello/Batina 2015 (https://eprint.iacr.org/2015/1060), Algorithm 1
        let b3 = &monty.b3;

        // 1. t0 ← X1 · X2
        let mut t0 = (&lhs.x).mul(&rhs.x);
        // 2. t1 ← Y1 · Y2
        let mut t1 = (&lhs.y).mul(&rhs.y);
        // 3. t2 ← Z1 · Z2
        let mut t2 = (&lhs.z).mul(&rhs.z);
        // 4. t3 ← X1 + Y1
        let mut t3 = (&lhs.x).add(&lhs.y);
        // 5. t4 ← X2 + Y2
        let mut t4 = (&rhs.x).add(&rhs.y);
        // 6. t3 ← t3 · t4
        t3 = (&t3).mul(&t4);
        // 7. t4 ← t0 + t1
        t4 = (&t0).add(&t1);
        // 8. t3 ← t3 − t4
        t3 = (&t3).sub(&t4);
        // 9. t4 ← X1 + Z1
        t4 = (&lhs.x).add(&lhs.z);
        // 10. t5 ← X2 + Z2
        let mut t5 = (&rhs.x).add(&rhs.z);
        // 11. t4 ← t4 · t5
        t4 = (&t4).mul(&t5);
        // 12. t5 ← t0 + t2
        t5 = (&t0).add(&t2);
        // 13. t4 ← t4 − t5
        t4 = (&t4).sub(&t5);
        // 14. t5 ← Y1 + Z1
        t5 = (&lhs.y).add(&lhs.z);
        // 15. X3 ← Y2 + Z2
        let mut x3 = (&rhs.y).add(&rhs.z);
        // 16. t5 ← t5 · X3
        t5 = (&t5).mul(&x3);
        // 17. X3 ← t1 + t2
        x3 = (&t1).add(&t2);
        // 18. t5 ← t5 − X3
        t5 = (&t5).sub(&x3);
        // 19. Z3 ← a · t4
        let mut z3 = (&monty.a).mul(&t4);
        // 20. X3 ← b3 · t2
        x3 = b3.mul(&t2);
        // 21. Z3 ← X3 + Z3
        z3 = (&x3).add(&z3);
        // 22. X3 ← t1 − Z3
        x3 = (&t1).sub(&z3);
        // 23. Z3 ← t1 + Z3
        z3 = (&t1).add(&z3);
        // 24. Y3 ← X3 · Z3
        let mut y3 = (&x3).mul(&z3);
        // 25. t1 ← t0 + t0
        t1 = (&t0).add(&t0);
        // 26. t1 ← t1 + t0
        t1 = (&t1).add(&t0);
        // 27. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 28. t4 ← b3 · t4
        t4 = b3.mul(&t4);
        // 29. t1 ← t1 + t2
        t1 = (&t1).add(&t2);
        // 30. t2 ← t0 − t2
        t2 = (&t0).sub(&t2);
        // 31. t2 ← a · t2
        t2 = (&monty.a).mul(&t2);
        // 32. t4 ← t4 + t2
        t4 = (&t4).add(&t2);
        // 33. t0 ← t1 · t4
        t0 = (&t1).mul(&t4);
        // 34. Y3 ← Y3 + t0
        y3 = (&y3).add(&t0);
        // 35. t0 ← t5 · t4
        t0 = (&t5).mul(&t4);
        // 36. X3 ← t3 · X3
        x3 = (&t3).mul(&x3);
        // 37. X3 ← X3 − t0
        x3 = (&x3).sub(&t0);
        // 38. t0 ← t3 · t1
        t0 = (&t3).mul(&t1);
        // 39. Z3 ← t5 · Z3
        z3 = (&t5).mul(&z3);
        // 40. Z3 ← Z3 + t0
        z3 = (&z3).add(&t0);
        MontyProjectivePoint { x: x3, y: y3, z: z3 }
    }

    fn internal_point_at_infinity(monty: &MontyKnowledge) -> MontyProjectivePoint {
        let x = BoxedMontyForm::zero(monty.params.clone());
        let y = BoxedMontyForm::one(monty.params.clone());
        let z = BoxedMontyForm::zero(monty.params.clone());
        MontyProjectivePoint { x, y, z }
    }

    /// Montgomery ladder over every bit of the scalar's precision.
    ///
    /// The bit only steers constant-time swaps of the two accumulators, so neither the control flow
    /// nor the sequence of field operations depends on the scalar.
    fn internal_multiply_scalar_with_point(monty: &MontyKnowledge, scalar: &BoxedUint, point: &MontyProjectivePoint) -> MontyProjectivePoint {
        debug_assert!(bool::from(Self::internal_is_on_curve(monty, point)));

        // invariant: r1 = r0 + point
        let mut r0 = Self::internal_point_at_infinity(monty);
        let mut r1 = point.clone();
        for i in (0..scalar.bits_precision()).rev() {
            let bit = scalar.bit(i);
            MontyProjectivePoint::conditional_swap(&mut r0, &mut r1, bit);
            r1 = Self::internal_add_points(monty, &r0, &r1);
            r0 = Self::internal_double_point(monty, &r0);
            MontyProjectivePoint::conditional_swap(&mut r0, &mut r1, bit);
        }

        debug_assert!(bool::from(Self::internal_is_on_curve(monty, &r0)));
        r0
    }

    pub fn is_on_curve_affine(&self, point: &AffinePoint) -> Choice {
        let Ok(monty) = self.monty_knowledge() else {
            return Choice::from(0);
        };
        let Some(point) = self.canonical_point(point) else {
            return Choice::from(0);
        };
        let projective = Self::internal_affine_to_monty_projective(&monty, &point);
        Self::internal_is_on_curve(&monty, &projective)
    }

    /// Whether the point is on the curve. The point at infinity always is.
    pub fn is_on_curve(&self, point: &Point) -> bool {
        match point {
            Point::Infinity => true,
            Point::Affine(affine) => bool::from(self.is_on_curve_affine(affine)),
        }
    }

    fn validated_affine(&self, point: &AffinePoint) -> Result<AffinePoint, Error> {
        let point = self.canonical_point(point)
            .ok_or(Error::InvalidPoint)?;
        if !bool::from(self.is_on_curve_affine(&point)) {
            return Err(Error::InvalidPoint);
        }
        Ok(point)
    }

    fn validated_point(&self, point: &Point) -> Result<Point, Error> {
        match point {
            Point::Infinity => Ok(Point::Infinity),
            Point::Affine(affine) => Ok(Point::Affine(self.validated_affine(affine)?)),
        }
    }

    /// Multiplies a point by a scalar.
    ///
    /// `0 * P` and `k * ∞` are the point at infinity.
    pub fn multiply(&self, scalar: &BoxedUint, point: &Point) -> Result<Point, Error> {
        let point = self.validated_point(point)?;
        let monty = self.monty_knowledge()?;
        let projective = Self::internal_point_to_monty_projective(&monty, &point);
        let product = Self::internal_multiply_scalar_with_point(&monty, scalar, &projective);
        Ok(Self::internal_monty_projective_to_point(&product))
    }

    /// Adds two points.
    pub fn add(&self, lhs: &Point, rhs: &Point) -> Result<Point, Error> {
        let lhs = self.validated_point(lhs)?;
        let rhs = self.validated_point(rhs)?;
        let monty = self.monty_knowledge()?;
        let lhs_proj = Self::internal_point_to_monty_projective(&monty, &lhs);
        let rhs_proj = Self::internal_point_to_monty_projective(&monty, &rhs);
        let sum = Self::internal_add_points(&monty, &lhs_proj, &rhs_proj);
        Ok(Self::internal_monty_projective_to_point(&sum))
    }

    /// Doubles a point.
    pub fn double(&self, point: &Point) -> Result<Point, Error> {
        let point = self.validated_point(point)?;
        let monty = self.monty_knowledge()?;
        let projective = Self::internal_point_to_monty_projective(&monty, &point);
        let doubled = Self::internal_double_point(&monty, &projective);
        Ok(Self::internal_monty_projective_to_point(&doubled))
    }

    /// Whether multiplying the point by the curve order yields the point at infinity.
    pub fn has_order(&self, point: &AffinePoint) -> Result<bool, Error> {
        let product = self.multiply(&self.order, &Point::Affine(point.clone()))?;
        Ok(product.is_infinity())
    }

    /// Calculates a public key from a private key.
    pub fn calculate_public_key(&self, private_key: &BoxedUint) -> Result<AffinePoint, Error> {
        // public_key = private_key * generator
        let product = self.multiply(private_key, &Point::Affine(self.generator.clone()))?;
        match product {
            Point::Infinity => Err(Error::WeakKey),
            Point::Affine(public_key) => Ok(public_key),
        }
    }

    /// Multiplies the other party's public key with our private key.
    ///
    /// Fails if the public key is not on the curve or if the result is the point at infinity.
    pub fn diffie_hellman(&self, private_key: &BoxedUint, other_public_key: &AffinePoint) -> Result<AffinePoint, Error> {
        // secret_key = private_key * other_public_key
        // defend against skullduggery: the other public key must be on the curve
        let other_public_key = self.validated_affine(other_public_key)?;
        let mut product = self.multiply(private_key, &Point::Affine(other_public_key))?;
        if self.cofactor != 1 {
            let cofactor = BoxedUint::from(u64::from(self.cofactor));
            product = self.multiply(&cofactor, &product)?;
        }
        match product {
            Point::Infinity => Err(Error::WeakKey),
            Point::Affine(secret) => Ok(secret),
        }
    }

    /// Derives the session curve for Generic Mapping.
    ///
    /// The new generator is `nonce * G + shared_secret`.
    pub fn derive_generic_mapping_session_curve(&self, nonce: &BoxedUint, shared_secret: &AffinePoint) -> Result<Self, Error> {
        let product = self.multiply(nonce, &Point::Affine(self.generator.clone()))?;
        let sum = self.add(&product, &Point::Affine(shared_secret.clone()))?;
        match sum {
            Point::Infinity => Err(Error::InvalidMapping),
            Point::Affine(new_generator) => self.with_generator(new_generator),
        }
    }

    /// Whether the point encoding of Integrated Mapping is available, i.e. `p ≡ 3 (mod 4)`.
    pub fn supports_integrated_mapping(&self) -> bool {
        self.prime.bit_vartime(0) && self.prime.bit_vartime(1)
    }

    /// Derives a new generator using Integrated Mapping from the given pseudorandom function result.
    ///
    /// Implements the point encoding of ICAO Doc 9303 Part 11 § 4.4.3.3.3 and therefore requires
    /// `p ≡ 3 (mod 4)`.
    pub fn derive_integrated_mapping_generator(&self, pseudorandom_result: &BoxedUint) -> Result<AffinePoint, Error> {
        if !self.supports_integrated_mapping() {
            return Err(Error::UnsupportedCurve);
        }

        let monty = self.monty_knowledge()?;
        let precision = self.prime.bits_precision();
        let t = self.canonical_field_element(pseudorandom_result)
            .ok_or(Error::InvalidMapping)?;
        let t_monty = BoxedMontyForm::new(t, monty.params.clone());
        let one_monty = BoxedMontyForm::one(monty.params.clone());
        let one = BoxedUint::one_with_precision(precision);

        // step 1: α = -t²
        let alpha = t_monty.square().neg();

        // step 2: X2 = -b(1 + α + α²) / (a(α + α²))
        let minus_b = (&monty.b).neg();
        let alpha_plus_alpha_squared = (&alpha).add(&alpha.square());
        let one_plus_alpha_plus_alpha_squared = (&one_monty).add(&alpha_plus_alpha_squared);
        let denominator = (&monty.a).mul(&alpha_plus_alpha_squared);
        let inverse = denominator.invert().into_option()
            .ok_or(Error::InvalidMapping)?;
        let x2 = (&minus_b).mul(&one_plus_alpha_plus_alpha_squared).mul(&inverse);

        // step 3: X3 = αX2
        let x3 = (&alpha).mul(&x2);

        // step 4: h2 = X2³ + aX2 + b
        let h2 = x2.square().mul(&x2).add(&(&monty.a).mul(&x2)).add(&monty.b);

        // step 6: U = t³h2
        let u = t_monty.square().mul(&t_monty).mul(&h2);

        // step 7: A = h2^(p - 1 - (p + 1)/4)
        // for p ≡ 3 (mod 4), (p + 1)/4 = (p >> 2) + 1
        let quarter = self.prime.shr(2).wrapping_add(&one);
        let exponent = self.prime.wrapping_sub(&one).wrapping_sub(&quarter);
        let a = h2.pow(&exponent);

        // step 8: pick the coordinates depending on whether h2 is a square
        let aah2 = (&a).square().mul(&h2);
        let (x, y) = if aah2 == one_monty {
            (x2, (&a).mul(&h2))
        } else {
            (x3, (&a).mul(&u))
        };
        let mut point = MontyProjectivePoint { x, y, z: one_monty };
        if !bool::from(Self::internal_is_on_curve(&monty, &point)) {
            return Err(Error::InvalidMapping);
        }

        if self.cofactor != 1 {
            let cofactor = BoxedUint::from(u64::from(self.cofactor));
            point = Self::internal_multiply_scalar_with_point(&monty, &cofactor, &point);
        }
        match Self::internal_monty_projective_to_point(&point) {
            Point::Infinity => Err(Error::InvalidMapping),
            Point::Affine(generator) => {
                if !self.has_order(&generator)? {
                    return Err(Error::InvalidMapping);
                }
                Ok(generator)
            },
        }
    }
}
