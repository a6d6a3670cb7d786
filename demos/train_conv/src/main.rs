// Train Conv — Small convolutional classifier on synthetic images (Dexe)
//
// Trains the classic single-block network on class-conditional Gaussian
// images, one sample per step:
//
//   Convolution(3→c, 5×5) → Tanh → MaxPool(4×4) → Squash(→classes) → Softmax
//
// Features demonstrated:
//   1. Building and finishing a Network
//   2. Seeded normal initialisation
//   3. Trainer epochs with per-epoch elapsed / loss / correct reporting
//   4. Adversarial copies of the training set (fast gradient sign)
//   5. Save/load of the flat parameter buffer
//
// Usage:
//   cargo run -p train-conv-demo                            # defaults
//   cargo run -p train-conv-demo -- --epochs 10 --lr 0.01   # more epochs
//   cargo run -p train-conv-demo -- --adv 100 --adv-step 0.02
//   cargo run -p train-conv-demo -- --save model.dexe       # save after training
//   RUST_LOG=debug cargo run -p train-conv-demo             # verbose logs

use std::str::FromStr;

use dexe::prelude::*;

// Configuration

struct Config {
    epochs: usize,
    lr: f64,
    l2: f64,
    std: f64,
    seed: u64,
    samples: usize,
    classes: usize,
    channels: usize,
    size: usize,
    noise: f32,
    adv: usize,
    adv_step: f32,
    log_every: usize,
    save_path: Option<String>,
    load_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epochs: 5,
            lr: 0.005,
            l2: 0.0,
            std: 0.05,
            seed: 1,
            samples: 400,
            classes: 4,
            channels: 16,
            size: 16,
            noise: 0.5,
            adv: 0,
            adv_step: 0.01,
            log_every: 0,
            save_path: None,
            load_path: None,
        }
    }
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> T {
    match args.get(i).map(|s| s.parse()) {
        Some(Ok(v)) => v,
        _ => {
            eprintln!("invalid or missing value for {flag}");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Config {
    let mut cfg = Config::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--epochs" => {
                i += 1;
                cfg.epochs = value(&args, i, flag);
            }
            "--lr" => {
                i += 1;
                cfg.lr = value(&args, i, flag);
            }
            "--l2" => {
                i += 1;
                cfg.l2 = value(&args, i, flag);
            }
            "--std" => {
                i += 1;
                cfg.std = value(&args, i, flag);
            }
            "--seed" => {
                i += 1;
                cfg.seed = value(&args, i, flag);
            }
            "--samples" => {
                i += 1;
                cfg.samples = value(&args, i, flag);
            }
            "--classes" => {
                i += 1;
                cfg.classes = value(&args, i, flag);
            }
            "--channels" => {
                i += 1;
                cfg.channels = value(&args, i, flag);
            }
            "--size" => {
                i += 1;
                cfg.size = value(&args, i, flag);
            }
            "--noise" => {
                i += 1;
                cfg.noise = value(&args, i, flag);
            }
            "--adv" => {
                i += 1;
                cfg.adv = value(&args, i, flag);
            }
            "--adv-step" => {
                i += 1;
                cfg.adv_step = value(&args, i, flag);
            }
            "--log-every" => {
                i += 1;
                cfg.log_every = value(&args, i, flag);
            }
            "--save" => {
                i += 1;
                cfg.save_path = Some(value(&args, i, flag));
            }
            "--load" => {
                i += 1;
                cfg.load_path = Some(value(&args, i, flag));
            }
            "--help" | "-h" => {
                println!("Convolutional classifier training demo for Dexe");
                println!();
                println!("Options:");
                println!("  --epochs <n>       Training epochs (default: 5)");
                println!("  --lr <f>           Learning rate (default: 0.005)");
                println!("  --l2 <f>           L2 coefficient (default: 0)");
                println!("  --std <f>          Init standard deviation (default: 0.05)");
                println!("  --seed <n>         Seed for data, init and shuffling (default: 1)");
                println!("  --samples <n>      Training samples (default: 400)");
                println!("  --classes <n>      Number of classes (default: 4)");
                println!("  --channels <n>     Convolution output channels (default: 16)");
                println!("  --size <n>         Image height and width (default: 16)");
                println!("  --noise <f>        Per-pixel noise std (default: 0.5)");
                println!("  --adv <n>          Append n adversarial samples after epoch 1");
                println!("  --adv-step <f>     Adversarial step size (default: 0.01)");
                println!("  --log-every <n>    Log the network output every n steps");
                println!("  --save <path>      Save trained parameters");
                println!("  --load <path>      Load parameters before training");
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    cfg
}

// Main

fn main() -> dexe::Result<()> {
    dexe::init_tracing();
    let cfg = parse_args();

    let image = Shape::new(1, 3, cfg.size, cfg.size);
    let train = SyntheticDataset::new(image, cfg.classes, cfg.samples, cfg.noise, cfg.seed)?;
    let test = train.resample(cfg.samples / 4, cfg.seed.wrapping_add(1));
    println!(
        "Synthetic data: {} train / {} test images {}, {} classes",
        train.count(),
        test.count(),
        train.sample_shape(),
        cfg.classes
    );

    let mut net = Network::<f32>::new(image);
    net.add_conv(cfg.channels, 5, 5)?;
    net.add_tanh()?;
    net.add_pool(4, 4)?;
    net.add_squash(cfg.classes)?;
    net.add_softmax()?;
    net.finish()?;

    let mut ctx = Context::seeded(cfg.seed);
    net.init_normal(&mut ctx, 0.0, cfg.std as f32)?;
    if let Some(path) = &cfg.load_path {
        net.load(path)?;
        println!("Loaded parameters from {path}");
    }
    println!();
    print!("{}", net.describe());
    println!();

    let config = TrainConfig::default()
        .learning_rate(cfg.lr)
        .l2(cfg.l2)
        .seed(cfg.seed)
        .log_every(cfg.log_every);
    let mut trainer = Trainer::new(config);

    let mut data = VecDataset::collect(&train)?;
    for epoch in 0..cfg.epochs {
        let stats = trainer.train_epoch(&mut net, &data, &mut ctx)?;
        println!("{stats}");

        if epoch == 0 && cfg.adv > 0 {
            let added = add_n_adversarial(&mut net, &mut data, cfg.adv, cfg.adv_step)?;
            tracing::info!(added, total = data.count(), step = cfg.adv_step, "adversarial samples");
        }
    }

    let eval = trainer.evaluate(&mut net, &test, &mut ctx)?;
    println!();
    println!(
        "Test: loss {:.6} correct {}/{} ({:.1}%)",
        eval.loss,
        eval.n_correct,
        eval.n_samples,
        100.0 * eval.accuracy()
    );

    if let Some(path) = &cfg.save_path {
        net.save(path)?;
        println!("Saved {} parameters to {path}", net.n_params());
    }
    Ok(())
}
